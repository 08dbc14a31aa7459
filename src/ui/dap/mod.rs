mod hook;
mod logger;
pub mod server;
pub mod spy;

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::anyhow;
use dap::events::Event;
use dap::requests::{Command, Request};
use dap::responses::{
    ContinueResponse, EvaluateResponse, ExceptionInfoResponse, ResponseBody, ScopesResponse,
    SetBreakpointsResponse, StackTraceResponse, ThreadsResponse, VariablesResponse,
};
use dap::types::{
    Breakpoint, Capabilities, EvaluateArgumentsContext, ExceptionBreakMode, ExceptionDetails,
    Scope, ScopePresentationhint, Source, StackFrame, Thread, Variable, VariablePresentationHint,
    VariablePresentationHintKind,
};
use itertools::Itertools;
use serde::Deserialize;

use crate::debugger::DebugSession;
use crate::sync::Signal;
use crate::ui::EngineFactory;
use hook::DapHook;
use logger::DapLogger;
use server::DapServer;

/// Fixed variable references of the three synthetic scopes.
const REF_REGISTERS: i64 = 1;
const REF_STACK: i64 = 2;
const REF_EFLAGS: i64 = 3;

/// Extension fields of the launch request.
#[derive(Deserialize, Debug)]
struct LaunchArguments {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

/// One DAP client bound to one debug session.
pub struct DapApplication<R: Read, W: Write + Send + 'static> {
    server: DapServer<R, W>,
    engine_factory: EngineFactory,
    session: Option<DebugSession>,
    terminate: Arc<Signal>,
}

impl<R: Read, W: Write + Send + 'static> DapApplication<R, W> {
    pub fn new(server: DapServer<R, W>, engine_factory: EngineFactory) -> DapApplication<R, W> {
        DapApplication {
            server,
            engine_factory,
            session: None,
            terminate: Arc::new(Signal::new()),
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let logger = DapLogger::new(self.server.output());
        let filter = logger.filter();
        crate::log::LOGGER.switch(logger, filter);

        loop {
            let req = match self.server.poll_request() {
                Ok(Some(req)) => req,
                Ok(None) => {
                    log::warn!(target: "dap", "unexpected end of input stream");
                    break;
                }
                Err(e) => {
                    if self.terminate.is_fired() {
                        break;
                    }
                    log::error!(target: "dap", "{e}");
                    // invalid data closes the session
                    break;
                }
            };

            match self.handle_request(req) {
                Ok(true) => { /* served */ }
                Ok(false) => break,
                Err(e) => {
                    log::error!(target: "dap", "{e:#}");
                }
            }
        }

        // the client is gone; tear the session down with it
        self.session.take();

        Ok(())
    }

    fn handle_request(&mut self, req: Request) -> anyhow::Result<bool> {
        macro_rules! session_or_fail {
            () => {{
                let Some(session) = &self.session else {
                    self.server.respond_error(req.seq, "No running session")?;
                    anyhow::bail!("no running session");
                };
                session
            }};
        }

        match req.command {
            Command::Initialize(_args) => {
                self.server.respond_success(
                    req.seq,
                    ResponseBody::Initialize(Capabilities {
                        supports_configuration_done_request: Some(true),
                        supports_evaluate_for_hovers: Some(true),
                        supports_exception_info_request: Some(true),
                        ..Default::default()
                    }),
                )?;
            }
            Command::Launch(args) => {
                let data = args
                    .additional_data
                    .as_ref()
                    .ok_or_else(|| anyhow!("missing launch arguments"))?;
                let launch: LaunchArguments = serde_json::from_value(data.clone())?;

                log::info!(target: "dap", "launch: {}", launch.program);

                let engine = match (self.engine_factory)() {
                    Ok(engine) => engine,
                    Err(e) => {
                        self.server.respond_error(req.seq, format!("{e:#}"))?;
                        return Ok(true);
                    }
                };

                let hook = DapHook::new(self.server.output(), self.terminate.clone());
                let session =
                    DebugSession::launch(engine, launch.program, launch.args, hook);

                // the reply is gated on the worker consuming the initial break
                if let Err(e) = session.wait_for_initialization() {
                    self.server.respond_error(req.seq, e.to_string())?;
                    return Ok(true);
                }
                self.session = Some(session);

                self.server.respond_success(req.seq, ResponseBody::Launch)?;
                self.server.send_event(Event::Initialized)?;
            }
            Command::Attach(_args) => {
                self.server
                    .respond_error(req.seq, "Attach to process is not supported")?;
            }
            Command::ConfigurationDone => {
                let session = session_or_fail!();
                session.run();
                self.server
                    .respond_success(req.seq, ResponseBody::ConfigurationDone)?;
            }
            Command::SetBreakpoints(args) => {
                let session = session_or_fail!();

                let source_path = args
                    .source
                    .path
                    .clone()
                    .ok_or_else(|| anyhow!("setBreakpoints: missing source path"))?;
                let lines: Vec<u32> = args
                    .breakpoints
                    .iter()
                    .flatten()
                    .map(|bp| bp.line as u32)
                    .collect();

                let views = session.set_breakpoints(source_path, lines);

                self.server.respond_success(
                    req.seq,
                    ResponseBody::SetBreakpoints(SetBreakpointsResponse {
                        breakpoints: views
                            .iter()
                            .map(|view| Breakpoint {
                                id: view.id.map(i64::from),
                                verified: view.verified,
                                line: Some(view.line as i64),
                                source: Some(args.source.clone()),
                                ..Default::default()
                            })
                            .collect_vec(),
                    }),
                )?;
            }
            Command::Threads => {
                // a single synthetic thread stands in for the target
                self.server.respond_success(
                    req.seq,
                    ResponseBody::Threads(ThreadsResponse {
                        threads: vec![Thread {
                            id: 1,
                            name: "Main Thread".to_string(),
                        }],
                    }),
                )?;
            }
            Command::StackTrace(_args) => {
                let session = session_or_fail!();

                let stack_frames = session
                    .call_stack()
                    .into_iter()
                    .map(|frame| StackFrame {
                        id: frame.id as i64,
                        name: frame.name,
                        source: frame.source.map(|path| Source {
                            name: path
                                .file_name()
                                .map(|name| name.to_string_lossy().into_owned()),
                            path: Some(path.to_string_lossy().into_owned()),
                            ..Default::default()
                        }),
                        line: frame.line.unwrap_or(0) as i64,
                        column: 1,
                        ..Default::default()
                    })
                    .collect_vec();

                self.server.respond_success(
                    req.seq,
                    ResponseBody::StackTrace(StackTraceResponse {
                        total_frames: Some(stack_frames.len() as i64),
                        stack_frames,
                    }),
                )?;
            }
            Command::Scopes(_args) => {
                self.server.respond_success(
                    req.seq,
                    ResponseBody::Scopes(ScopesResponse {
                        scopes: vec![
                            Scope {
                                name: "Registers".to_string(),
                                presentation_hint: Some(ScopePresentationhint::Registers),
                                variables_reference: REF_REGISTERS,
                                expensive: false,
                                ..Default::default()
                            },
                            Scope {
                                name: "Stack".to_string(),
                                presentation_hint: Some(ScopePresentationhint::Locals),
                                variables_reference: REF_STACK,
                                expensive: false,
                                ..Default::default()
                            },
                        ],
                    }),
                )?;
            }
            Command::Variables(args) => {
                let session = session_or_fail!();

                let variables = match args.variables_reference {
                    REF_REGISTERS => {
                        let mut variables = session
                            .registers()
                            .into_iter()
                            .map(|register| Variable {
                                name: register.name,
                                value: register.value,
                                presentation_hint: Some(readonly_hint(
                                    VariablePresentationHintKind::Property,
                                )),
                                ..Default::default()
                            })
                            .collect_vec();
                        // synthetic parent entry, expanded via the EFLAGS scope
                        variables.push(Variable {
                            name: "EFLAGS".to_string(),
                            variables_reference: REF_EFLAGS,
                            presentation_hint: Some(readonly_hint(
                                VariablePresentationHintKind::Property,
                            )),
                            ..Default::default()
                        });
                        variables
                    }
                    REF_STACK => session
                        .stack_contents()
                        .into_iter()
                        .map(|entry| Variable {
                            name: entry.address,
                            value: entry.value,
                            presentation_hint: Some(readonly_hint(
                                VariablePresentationHintKind::Method,
                            )),
                            ..Default::default()
                        })
                        .collect_vec(),
                    REF_EFLAGS => session
                        .eflags()
                        .into_iter()
                        .map(|flag| Variable {
                            name: flag.name.to_string(),
                            value: flag.value.to_string(),
                            presentation_hint: Some(readonly_hint(
                                VariablePresentationHintKind::Property,
                            )),
                            ..Default::default()
                        })
                        .collect_vec(),
                    _ => vec![],
                };

                self.server.respond_success(
                    req.seq,
                    ResponseBody::Variables(VariablesResponse { variables }),
                )?;
            }
            Command::Evaluate(args) => {
                let session = session_or_fail!();

                let result = match args.context {
                    Some(EvaluateArgumentsContext::Hover) => {
                        let value = session.evaluate_variable(args.expression.clone());
                        if value.is_empty() {
                            // an error result suppresses the hover popup
                            self.server.respond_error(req.seq, "no hover information")?;
                            return Ok(true);
                        }
                        value
                    }
                    None
                    | Some(EvaluateArgumentsContext::Watch)
                    | Some(EvaluateArgumentsContext::Repl) => {
                        session.evaluate(args.expression.clone())
                    }
                    Some(_) => "<Unsupported context>".to_string(),
                };

                self.server.respond_success(
                    req.seq,
                    ResponseBody::Evaluate(EvaluateResponse {
                        result,
                        ..Default::default()
                    }),
                )?;
            }
            Command::ExceptionInfo(_args) => {
                let session = session_or_fail!();

                match session.exception_info() {
                    Some(info) => {
                        self.server.respond_success(
                            req.seq,
                            ResponseBody::ExceptionInfo(ExceptionInfoResponse {
                                exception_id: info.exception_id.clone(),
                                description: Some(info.description.clone()),
                                break_mode: ExceptionBreakMode::Unhandled,
                                details: Some(ExceptionDetails {
                                    message: Some(info.description),
                                    type_name: Some(info.type_name.clone()),
                                    full_type_name: Some(info.type_name),
                                    evaluate_name: Some(info.exception_id),
                                    ..Default::default()
                                }),
                            }),
                        )?;
                    }
                    None => {
                        self.server
                            .respond_error(req.seq, "No exception information")?;
                    }
                }
            }
            Command::Continue(_args) => {
                let session = session_or_fail!();
                session.run();
                self.server.respond_success(
                    req.seq,
                    ResponseBody::Continue(ContinueResponse {
                        all_threads_continued: Some(true),
                    }),
                )?;
            }
            Command::Pause(_args) => {
                let session = session_or_fail!();
                session.pause();
                self.server.respond_success(req.seq, ResponseBody::Pause)?;
            }
            Command::Next(_args) => {
                let session = session_or_fail!();
                session.step_over();
                self.server.respond_success(req.seq, ResponseBody::Next)?;
            }
            Command::StepIn(_args) => {
                let session = session_or_fail!();
                session.step_into();
                self.server.respond_success(req.seq, ResponseBody::StepIn)?;
            }
            Command::StepOut(_args) => {
                let session = session_or_fail!();
                session.step_out();
                self.server
                    .respond_success(req.seq, ResponseBody::StepOut)?;
            }
            Command::Disconnect(_) => {
                // dropping the session blocks until the worker has torn the
                // engine down and sent `terminated`/`exited`, so those
                // events precede the disconnect reply
                if let Some(session) = self.session.take() {
                    drop(session);
                } else {
                    log::warn!(target: "dap", "no active debug session");
                }
                self.server
                    .respond_success(req.seq, ResponseBody::Disconnect)?;
                self.terminate.fire();
                return Ok(false);
            }
            _ => {
                log::warn!(target: "dap", "unknown command: {:?}", req.command);
                self.server.respond_cancel(req.seq)?;
            }
        }

        Ok(true)
    }
}

fn readonly_hint(kind: VariablePresentationHintKind) -> VariablePresentationHint {
    VariablePresentationHint {
        kind: Some(kind),
        ..Default::default()
    }
}
