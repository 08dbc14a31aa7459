//! DbgEng backend: [`DebugEngine`] over the Windows debugging engine COM
//! interfaces (IDebugClient / IDebugControl / IDebugSymbols / IDebugRegisters
//! / IDebugSystemObjects / IDebugDataSpaces).
//!
//! Threading contract: DbgEng objects must be driven from one thread; the
//! engine worker owns this instance. `SetInterrupt` is the documented
//! exception and is issued without touching any other engine state.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use windows::Win32::System::Diagnostics::Debug::Extensions::{
    DEBUG_ANY_ID, DEBUG_BREAKPOINT_CODE, DEBUG_BREAKPOINT_ENABLED, DEBUG_BREAKPOINT_ONE_SHOT,
    DEBUG_END_ACTIVE_TERMINATE, DEBUG_ENGOPT_INITIAL_BREAK, DEBUG_EVENT_BREAKPOINT,
    DEBUG_EVENT_EXCEPTION, DEBUG_EVENT_EXIT_PROCESS, DEBUG_FILTER_BREAK,
    DEBUG_FILTER_GO_NOT_HANDLED, DEBUG_INTERRUPT_ACTIVE, DEBUG_LAST_EVENT_INFO_EXCEPTION,
    DEBUG_PROCESS, DEBUG_STACK_FRAME, DEBUG_STATUS_GO, DEBUG_STATUS_NO_DEBUGGEE,
    DEBUG_STATUS_STEP_INTO, DEBUG_STATUS_STEP_OVER, DEBUG_VALUE, DEBUG_VALUE_INT32,
    DEBUG_VALUE_INT64, DebugCreate, IDebugBreakpoint, IDebugClient, IDebugControl3,
    IDebugDataSpaces, IDebugRegisters, IDebugSymbols, IDebugSystemObjects,
    DEBUG_EXCEPTION_FILTER_PARAMETERS,
};
use windows::Win32::System::SystemInformation::IMAGE_FILE_MACHINE_I386;
use windows::core::{Interface, PCSTR};

use super::{
    BreakpointHandle, BreakpointKind, CreateFlags, DebugEngine, EngineError, EngineResult,
    EventType, ExceptionRecord, ExecutionStatus, FilterAction, Frame, LastEvent, Processor,
    Scalar, ScalarKind, TypeInfo, WaitOutcome,
};

const INFINITE: u32 = 0xFFFF_FFFF;

struct Interfaces {
    client: IDebugClient,
    control: IDebugControl3,
    symbols: IDebugSymbols,
    registers: IDebugRegisters,
    system_objects: IDebugSystemObjects,
    data_spaces: IDebugDataSpaces,
}

pub struct DbgEng {
    com: Interfaces,
    breakpoints: Mutex<HashMap<u32, IDebugBreakpoint>>,
}

// The engine worker is the only caller of every operation except
// `interrupt`, which DbgEng documents as callable from any thread.
unsafe impl Send for DbgEng {}
unsafe impl Sync for DbgEng {}

fn api(call: &'static str) -> impl FnOnce(windows::core::Error) -> EngineError {
    move |err| EngineError::Api {
        call,
        code: err.code().0,
    }
}

fn c_string(value: &str) -> CString {
    CString::new(value).unwrap_or_default()
}

impl DbgEng {
    /// Create the engine client and query the interface set the adapter
    /// drives.
    pub fn create() -> EngineResult<DbgEng> {
        unsafe {
            let client: IDebugClient = DebugCreate().map_err(api("DebugCreate"))?;
            let control: IDebugControl3 = client.cast().map_err(api("QueryInterface"))?;
            let symbols: IDebugSymbols = client.cast().map_err(api("QueryInterface"))?;
            let registers: IDebugRegisters = client.cast().map_err(api("QueryInterface"))?;
            let system_objects: IDebugSystemObjects =
                client.cast().map_err(api("QueryInterface"))?;
            let data_spaces: IDebugDataSpaces = client.cast().map_err(api("QueryInterface"))?;

            control
                .SetEngineOptions(DEBUG_ENGOPT_INITIAL_BREAK)
                .map_err(api("SetEngineOptions"))?;

            Ok(DbgEng {
                com: Interfaces {
                    client,
                    control,
                    symbols,
                    registers,
                    system_objects,
                    data_spaces,
                },
                breakpoints: Mutex::new(HashMap::new()),
            })
        }
    }

    fn scalar_from(value: &DEBUG_VALUE) -> Scalar {
        unsafe {
            match value.Type {
                DEBUG_VALUE_INT64 => Scalar::U64(value.Anonymous.I64),
                _ => Scalar::U32(value.Anonymous.I32),
            }
        }
    }
}

impl DebugEngine for DbgEng {
    fn create_process(&self, command_line: &str, flags: CreateFlags) -> EngineResult<()> {
        let flags = match flags {
            CreateFlags::DebugProcessTree => DEBUG_PROCESS,
            CreateFlags::DebugOnlyThisProcess => DEBUG_PROCESS,
        };
        let command_line = c_string(command_line);
        unsafe {
            self.com
                .client
                .CreateProcessA(0, PCSTR(command_line.as_ptr().cast()), flags)
                .map_err(api("CreateProcess"))
        }
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> EngineResult<WaitOutcome> {
        let timeout = timeout
            .map(|timeout| timeout.as_millis().min(u128::from(INFINITE)) as u32)
            .unwrap_or(INFINITE);
        unsafe {
            if let Err(err) = self.com.control.WaitForEvent(0, timeout) {
                return Err(EngineError::Api {
                    call: "WaitForEvent",
                    code: err.code().0,
                });
            }
            match self.com.control.GetExecutionStatus() {
                Ok(DEBUG_STATUS_NO_DEBUGGEE) => Ok(WaitOutcome::NoDebuggee),
                _ => Ok(WaitOutcome::Break),
            }
        }
    }

    fn get_last_event(&self) -> EngineResult<LastEvent> {
        let mut event_type = 0u32;
        let mut process_id = 0u32;
        let mut thread_id = 0u32;
        let mut extra = DEBUG_LAST_EVENT_INFO_EXCEPTION::default();
        let mut extra_used = 0u32;
        let mut description = [0u8; 256];
        let mut description_used = 0u32;

        unsafe {
            self.com
                .control
                .GetLastEventInformation(
                    &mut event_type,
                    &mut process_id,
                    &mut thread_id,
                    Some((&mut extra as *mut DEBUG_LAST_EVENT_INFO_EXCEPTION).cast()),
                    size_of::<DEBUG_LAST_EVENT_INFO_EXCEPTION>() as u32,
                    Some(&mut extra_used),
                    Some(&mut description),
                    Some(&mut description_used),
                )
                .map_err(api("GetLastEventInformation"))?;
        }

        let kind = match event_type {
            0 => EventType::None,
            DEBUG_EVENT_BREAKPOINT => EventType::Breakpoint,
            DEBUG_EVENT_EXCEPTION => EventType::Exception,
            DEBUG_EVENT_EXIT_PROCESS => EventType::ExitProcess,
            other => EventType::Other(other),
        };

        let exception = (kind == EventType::Exception
            && extra_used as usize >= size_of::<DEBUG_LAST_EVENT_INFO_EXCEPTION>())
        .then(|| ExceptionRecord {
            code: extra.ExceptionRecord.ExceptionCode.0 as u32,
            address: extra.ExceptionRecord.ExceptionAddress,
            first_chance: extra.FirstChance != 0,
        });

        let description_len = description
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(description.len());

        Ok(LastEvent {
            event_type: kind,
            process_id,
            thread_id,
            description: String::from_utf8_lossy(&description[..description_len]).into_owned(),
            exception,
        })
    }

    fn set_execution_status(&self, status: ExecutionStatus) -> EngineResult<()> {
        unsafe {
            match status {
                ExecutionStatus::Go => self
                    .com
                    .control
                    .SetExecutionStatus(DEBUG_STATUS_GO)
                    .map_err(api("SetExecutionStatus")),
                ExecutionStatus::StepOver => self
                    .com
                    .control
                    .SetExecutionStatus(DEBUG_STATUS_STEP_OVER)
                    .map_err(api("SetExecutionStatus")),
                ExecutionStatus::StepInto => self
                    .com
                    .control
                    .SetExecutionStatus(DEBUG_STATUS_STEP_INTO)
                    .map_err(api("SetExecutionStatus")),
                ExecutionStatus::Goto(offset) => {
                    let command = c_string(&format!("g 0x{offset:x}"));
                    self.com
                        .control
                        .Execute(0, PCSTR(command.as_ptr().cast()), 0)
                        .map_err(api("Execute"))
                }
            }
        }
    }

    fn interrupt(&self) -> EngineResult<()> {
        unsafe {
            self.com
                .control
                .SetInterrupt(DEBUG_INTERRUPT_ACTIVE)
                .map_err(api("SetInterrupt"))
        }
    }

    fn end_session(&self) -> EngineResult<()> {
        self.breakpoints.lock().unwrap().clear();
        unsafe {
            self.com
                .client
                .EndSession(DEBUG_END_ACTIVE_TERMINATE)
                .map_err(api("EndSession"))
        }
    }

    fn add_breakpoint(&self, kind: BreakpointKind, one_shot: bool) -> EngineResult<BreakpointHandle> {
        let BreakpointKind::Code = kind;
        unsafe {
            let bp = self
                .com
                .control
                .AddBreakpoint(DEBUG_BREAKPOINT_CODE, DEBUG_ANY_ID)
                .map_err(api("AddBreakpoint"))?;
            if one_shot {
                bp.AddFlags(DEBUG_BREAKPOINT_ONE_SHOT)
                    .map_err(api("AddFlags"))?;
            }
            let id = bp.GetId().map_err(api("GetId"))?;
            self.breakpoints.lock().unwrap().insert(id, bp);
            Ok(BreakpointHandle(id))
        }
    }

    fn breakpoint_set_offset(&self, handle: BreakpointHandle, offset: u64) -> EngineResult<()> {
        let breakpoints = self.breakpoints.lock().unwrap();
        let bp = breakpoints
            .get(&handle.0)
            .ok_or(EngineError::UnknownBreakpoint)?;
        unsafe { bp.SetOffset(offset).map_err(api("SetOffset")) }
    }

    fn breakpoint_enable(&self, handle: BreakpointHandle) -> EngineResult<()> {
        let breakpoints = self.breakpoints.lock().unwrap();
        let bp = breakpoints
            .get(&handle.0)
            .ok_or(EngineError::UnknownBreakpoint)?;
        unsafe { bp.SetFlags(DEBUG_BREAKPOINT_ENABLED).map_err(api("SetFlags")) }
    }

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> EngineResult<()> {
        let bp = self
            .breakpoints
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or(EngineError::UnknownBreakpoint)?;
        unsafe { self.com.control.RemoveBreakpoint(&bp).map_err(api("RemoveBreakpoint")) }
    }

    fn symbol_offset_by_line(&self, source: &Path, line: u32) -> EngineResult<u64> {
        let file = c_string(&source.to_string_lossy());
        unsafe {
            self.com
                .symbols
                .GetOffsetByLine(line, PCSTR(file.as_ptr().cast()))
                .map_err(|_| EngineError::LineNotMapped {
                    file: source.to_path_buf(),
                    line,
                })
        }
    }

    fn symbol_name_by_offset(&self, offset: u64) -> EngineResult<(String, u64)> {
        let mut name = [0u8; 256];
        let mut name_size = 0u32;
        let mut displacement = 0u64;
        unsafe {
            self.com
                .symbols
                .GetNameByOffset(
                    offset,
                    Some(&mut name),
                    Some(&mut name_size),
                    Some(&mut displacement),
                )
                .map_err(|_| EngineError::OffsetNotMapped(offset))?;
        }
        let len = name.iter().position(|&byte| byte == 0).unwrap_or(0);
        Ok((
            String::from_utf8_lossy(&name[..len]).into_owned(),
            displacement,
        ))
    }

    fn symbol_line_by_offset(&self, offset: u64) -> EngineResult<(u32, std::path::PathBuf)> {
        let mut line = 0u32;
        let mut file = [0u8; 260];
        let mut file_size = 0u32;
        unsafe {
            self.com
                .symbols
                .GetLineByOffset(
                    offset,
                    Some(&mut line),
                    Some(&mut file),
                    Some(&mut file_size),
                    None,
                )
                .map_err(|_| EngineError::OffsetNotMapped(offset))?;
        }
        let len = file.iter().position(|&byte| byte == 0).unwrap_or(0);
        Ok((
            line,
            std::path::PathBuf::from(String::from_utf8_lossy(&file[..len]).into_owned()),
        ))
    }

    fn symbol_type(&self, name: &str) -> EngineResult<TypeInfo> {
        let symbol = c_string(name);
        let mut type_id = 0u32;
        let mut module_base = 0u64;
        unsafe {
            self.com
                .symbols
                .GetSymbolTypeId(PCSTR(symbol.as_ptr().cast()), &mut type_id, Some(&mut module_base))
                .map_err(|_| EngineError::SymbolNotFound(name.to_string()))?;
            let size = self
                .com
                .symbols
                .GetTypeSize(module_base, type_id)
                .map_err(api("GetTypeSize"))?;
            Ok(TypeInfo {
                module_base,
                type_id,
                size,
            })
        }
    }

    fn set_symbol_path(&self, dir: &Path) -> EngineResult<()> {
        let path = c_string(&dir.to_string_lossy());
        unsafe {
            self.com
                .symbols
                .SetSymbolPath(PCSTR(path.as_ptr().cast()))
                .map_err(api("SetSymbolPath"))
        }
    }

    fn reload_symbols(&self, flags: &str) -> EngineResult<()> {
        let flags = c_string(flags);
        unsafe {
            self.com
                .symbols
                .Reload(PCSTR(flags.as_ptr().cast()))
                .map_err(api("Reload"))
        }
    }

    fn registers_count(&self) -> EngineResult<u32> {
        unsafe {
            self.com
                .registers
                .GetNumberRegisters()
                .map_err(api("GetNumberRegisters"))
        }
    }

    fn register_description(&self, index: u32) -> EngineResult<String> {
        let mut name = [0u8; 64];
        let mut name_size = 0u32;
        unsafe {
            self.com
                .registers
                .GetDescription(index, Some(&mut name), Some(&mut name_size), None)
                .map_err(|_| EngineError::RegisterNotFound(index))?;
        }
        let len = name.iter().position(|&byte| byte == 0).unwrap_or(0);
        Ok(String::from_utf8_lossy(&name[..len]).into_owned())
    }

    fn register_value(&self, index: u32) -> EngineResult<Scalar> {
        let mut value = DEBUG_VALUE::default();
        unsafe {
            self.com
                .registers
                .GetValue(index, &mut value)
                .map_err(|_| EngineError::RegisterNotFound(index))?;
        }
        Ok(Self::scalar_from(&value))
    }

    fn instruction_offset(&self) -> EngineResult<u64> {
        unsafe {
            self.com
                .registers
                .GetInstructionOffset()
                .map_err(api("GetInstructionOffset"))
        }
    }

    fn stack_offset(&self) -> EngineResult<u64> {
        unsafe {
            self.com
                .registers
                .GetStackOffset()
                .map_err(api("GetStackOffset"))
        }
    }

    fn thread_ids(&self) -> EngineResult<Vec<u32>> {
        unsafe {
            let count = self
                .com
                .system_objects
                .GetNumberThreads()
                .map_err(api("GetNumberThreads"))?;
            let mut ids = vec![0u32; count as usize];
            self.com
                .system_objects
                .GetThreadIdsByIndex(0, count, Some(ids.as_mut_ptr()), None)
                .map_err(api("GetThreadIdsByIndex"))?;
            Ok(ids)
        }
    }

    fn set_current_thread(&self, id: u32) -> EngineResult<()> {
        unsafe {
            self.com
                .system_objects
                .SetCurrentThreadId(id)
                .map_err(|_| EngineError::ThreadNotFound(id))
        }
    }

    fn stack_trace(&self, max_frames: usize) -> EngineResult<Vec<Frame>> {
        let mut frames = vec![DEBUG_STACK_FRAME::default(); max_frames];
        let mut filled = 0u32;
        unsafe {
            self.com
                .control
                .GetStackTrace(0, 0, 0, &mut frames, Some(&mut filled))
                .map_err(api("GetStackTrace"))?;
        }
        frames.truncate(filled as usize);
        Ok(frames
            .into_iter()
            .map(|frame| Frame {
                instruction_offset: frame.InstructionOffset,
                frame_offset: frame.FrameOffset,
                return_offset: frame.ReturnOffset,
            })
            .collect())
    }

    fn read_virtual(&self, address: u64, len: usize) -> EngineResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut read = 0u32;
        unsafe {
            self.com
                .data_spaces
                .ReadVirtual(
                    address,
                    buffer.as_mut_ptr().cast(),
                    len as u32,
                    Some(&mut read),
                )
                .map_err(|_| EngineError::MemoryRead { address, len })?;
        }
        if (read as usize) < len {
            return Err(EngineError::MemoryRead { address, len });
        }
        Ok(buffer)
    }

    fn evaluate(&self, expression: &str, desired: Option<ScalarKind>) -> EngineResult<Scalar> {
        let desired = match desired {
            Some(ScalarKind::U32) => DEBUG_VALUE_INT32,
            Some(ScalarKind::U64) => DEBUG_VALUE_INT64,
            // DEBUG_VALUE_INVALID: the engine picks the width
            None => 0,
        };
        let expression_c = c_string(expression);
        let mut value = DEBUG_VALUE::default();
        unsafe {
            self.com
                .control
                .Evaluate(
                    PCSTR(expression_c.as_ptr().cast()),
                    desired,
                    &mut value,
                    None,
                )
                .map_err(|_| EngineError::Evaluation(expression.to_string()))?;
        }
        Ok(Self::scalar_from(&value))
    }

    fn set_effective_processor(&self, processor: Processor) -> EngineResult<()> {
        let Processor::X86 = processor;
        unsafe {
            self.com
                .control
                .SetEffectiveProcessorType(IMAGE_FILE_MACHINE_I386.0 as u32)
                .map_err(api("SetEffectiveProcessorType"))
        }
    }

    fn set_exception_filter(&self, code: u32, action: FilterAction) -> EngineResult<()> {
        let mut parameters = DEBUG_EXCEPTION_FILTER_PARAMETERS {
            ExceptionCode: code,
            ..Default::default()
        };
        match action {
            FilterAction::Break => parameters.ExecutionOption = DEBUG_FILTER_BREAK,
            FilterAction::GoNotHandled => {
                parameters.ContinueOption = DEBUG_FILTER_GO_NOT_HANDLED
            }
        }
        unsafe {
            self.com
                .control
                .SetExceptionFilterParameters(&[parameters])
                .map_err(api("SetExceptionFilterParameters"))
        }
    }
}
