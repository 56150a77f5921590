//! Request opcodes and the fast-path eligibility table.
//!
//! The opcode list is the single source of truth: the enum, its raw wire
//! values, the names used in logs and the fast-path allow-list are all
//! generated from one table, so the allow-list can never fall out of step
//! with the enumeration.
//!
//! A `fast` entry marks a bookkeeping-only operation that the shared-memory
//! accelerator may serve. Anything that creates, duplicates or closes a
//! descriptor, touches another process's memory or execution context, or
//! schedules a timer or debugger callback always goes over the socket.

macro_rules! opcodes {
    ($( $variant:ident => $name:literal, $fast:literal; )+) => {
        /// A request kind. The discriminant is the value sent on the wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum Opcode {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl Opcode {
            /// Every opcode, in wire order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),+];

            /// Number of opcodes.
            pub const COUNT: usize = Self::ALL.len();

            /// Protocol name, as used in traces.
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)+
                }
            }
        }

        /// Fast-path eligibility, indexed by opcode.
        pub static FAST_PATH: [bool; Opcode::COUNT] = [$($fast),+];
    };
}

opcodes! {
    NewProcess => "new_process", false;
    GetNewProcessInfo => "get_new_process_info", false;
    NewThread => "new_thread", false;
    GetStartupInfo => "get_startup_info", false;
    InitProcessDone => "init_process_done", false;
    InitThread => "init_thread", false;
    TerminateProcess => "terminate_process", false;
    TerminateThread => "terminate_thread", false;
    GetProcessInfo => "get_process_info", true;
    SetProcessInfo => "set_process_info", false;
    GetThreadInfo => "get_thread_info", true;
    SetThreadInfo => "set_thread_info", false;
    SuspendThread => "suspend_thread", false;
    ResumeThread => "resume_thread", false;
    QueueApc => "queue_apc", false;
    GetApcResult => "get_apc_result", false;
    CloseHandle => "close_handle", false;
    SetHandleInfo => "set_handle_info", false;
    DupHandle => "dup_handle", false;
    OpenProcess => "open_process", false;
    OpenThread => "open_thread", false;
    Select => "select", false;
    CreateEvent => "create_event", false;
    EventOp => "event_op", true;
    QueryEvent => "query_event", true;
    OpenEvent => "open_event", false;
    CreateMutex => "create_mutex", false;
    ReleaseMutex => "release_mutex", true;
    OpenMutex => "open_mutex", false;
    QueryMutex => "query_mutex", true;
    CreateSemaphore => "create_semaphore", false;
    ReleaseSemaphore => "release_semaphore", true;
    QuerySemaphore => "query_semaphore", true;
    OpenSemaphore => "open_semaphore", false;
    CreateFile => "create_file", false;
    OpenFileObject => "open_file_object", false;
    AllocFileHandle => "alloc_file_handle", false;
    GetHandleFd => "get_handle_fd", false;
    SetHandleCachedFd => "set_handle_cached_fd", false;
    Flush => "flush", false;
    CreateMapping => "create_mapping", false;
    OpenMapping => "open_mapping", false;
    GetMappingInfo => "get_mapping_info", true;
    ReadProcessMemory => "read_process_memory", false;
    WriteProcessMemory => "write_process_memory", false;
    CreateKey => "create_key", false;
    OpenKey => "open_key", false;
    DeleteKey => "delete_key", false;
    FlushKey => "flush_key", false;
    EnumKey => "enum_key", true;
    SetKeyValue => "set_key_value", true;
    GetKeyValue => "get_key_value", true;
    EnumKeyValue => "enum_key_value", true;
    DeleteKeyValue => "delete_key_value", true;
    LoadRegistry => "load_registry", false;
    UnloadRegistry => "unload_registry", false;
    SaveRegistry => "save_registry", false;
    SetRegistryNotification => "set_registry_notification", false;
    CreateTimer => "create_timer", false;
    OpenTimer => "open_timer", false;
    SetTimer => "set_timer", false;
    CancelTimer => "cancel_timer", false;
    GetTimerInfo => "get_timer_info", true;
    GetThreadContext => "get_thread_context", false;
    SetThreadContext => "set_thread_context", false;
    DebugProcess => "debug_process", false;
    WaitDebugEvent => "wait_debug_event", false;
    ContinueDebugEvent => "continue_debug_event", false;
    CreateNamedPipe => "create_named_pipe", false;
    GetNamedPipeInfo => "get_named_pipe_info", true;
    CreateMsgQueue => "create_msg_queue", false;
    SetQueueFd => "set_queue_fd", false;
    SetQueueMask => "set_queue_mask", true;
    GetQueueStatus => "get_queue_status", true;
    GetProcessIdleEvent => "get_process_idle_event", false;
    SendMessage => "send_message", false;
    PostQuitMessage => "post_quit_message", true;
    SendHardwareMessage => "send_hardware_message", false;
    GetMessage => "get_message", false;
    ReplyMessage => "reply_message", false;
    AcceptHardwareMessage => "accept_hardware_message", false;
    GetMessageReply => "get_message_reply", false;
    SetWinTimer => "set_win_timer", false;
    KillWinTimer => "kill_win_timer", false;
    AddAtom => "add_atom", true;
    DeleteAtom => "delete_atom", true;
    FindAtom => "find_atom", true;
    GetAtomInformation => "get_atom_information", true;
    BootDone => "boot_done", false;
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Map a raw wire value back to an opcode.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Whether the shared-memory fast path may serve this opcode.
    #[must_use]
    pub fn fast_path_eligible(self) -> bool {
        FAST_PATH[self as usize]
    }
}

/// Eligibility lookup for a raw wire value.
///
/// An unknown value means caller and table were built from different
/// definitions, so this panics instead of quietly routing the call.
#[must_use]
pub fn fast_path_eligible_raw(raw: u32) -> bool {
    match Opcode::from_raw(raw) {
        Some(op) => op.fast_path_eligible(),
        None => panic!("opcode {raw} is outside the request table ({} entries)", Opcode::COUNT),
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
