use std::io::Write;
use std::sync::{Arc, Mutex};

use dap::events::{Event, ExitedEventBody, StoppedEventBody};
use dap::server::ServerOutput;
use dap::types::StoppedEventReason;

use crate::debugger::EventHook;
use crate::sync::Signal;

/// Forwards session events to the client as DAP notifications.
///
/// Runs on the engine worker thread; the output half of the server is shared
/// behind a mutex with the request loop.
pub struct DapHook<W: Write> {
    output: Arc<Mutex<ServerOutput<W>>>,
    terminate: Arc<Signal>,
}

impl<W: Write> DapHook<W> {
    pub fn new(output: Arc<Mutex<ServerOutput<W>>>, terminate: Arc<Signal>) -> DapHook<W> {
        DapHook { output, terminate }
    }

    fn send_stopped(&self, body: StoppedEventBody) -> anyhow::Result<()> {
        let mut output = self.output.lock().unwrap();
        output.send_event(Event::Stopped(body))?;
        Ok(())
    }
}

fn stopped(reason: StoppedEventReason) -> StoppedEventBody {
    StoppedEventBody {
        reason,
        description: None,
        thread_id: Some(1),
        preserve_focus_hint: None,
        text: None,
        all_threads_stopped: None,
        hit_breakpoint_ids: None,
    }
}

impl<W: Write + Send + 'static> EventHook for DapHook<W> {
    fn on_breakpoint(&self) -> anyhow::Result<()> {
        self.send_stopped(stopped(StoppedEventReason::Breakpoint))
    }

    fn on_step(&self) -> anyhow::Result<()> {
        self.send_stopped(stopped(StoppedEventReason::Step))
    }

    fn on_pause(&self) -> anyhow::Result<()> {
        self.send_stopped(stopped(StoppedEventReason::Pause))
    }

    fn on_exception(&self, description: &str) -> anyhow::Result<()> {
        self.send_stopped(StoppedEventBody {
            description: Some(description.to_string()),
            all_threads_stopped: Some(true),
            ..stopped(StoppedEventReason::Exception)
        })
    }

    fn on_exit(&self) {
        let mut output = self.output.lock().unwrap();

        _ = output.send_event(Event::Terminated(None));
        _ = output.send_event(Event::Exited(ExitedEventBody { exit_code: 0 }));

        self.terminate.fire();
    }
}
