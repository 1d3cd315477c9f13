// Soft debugger command constants
//
// Command Sets:
// 1 = VirtualMachine
// 9 = ObjectReference
// 10 = StringReference
// 11 = ThreadReference
// 13 = ArrayReference
// 15 = EventRequest
// 16 = StackFrame
// 20 = AppDomain
// 21 = Assembly
// 22 = Method
// 23 = Type
// 24 = Module
// 25 = Field
// 64 = Event (agent -> debugger)

// Command set IDs
pub mod command_sets {
    pub const VIRTUAL_MACHINE: u8 = 1;
    pub const OBJECT_REFERENCE: u8 = 9;
    pub const STRING_REFERENCE: u8 = 10;
    pub const THREAD_REFERENCE: u8 = 11;
    pub const ARRAY_REFERENCE: u8 = 13;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const APP_DOMAIN: u8 = 20;
    pub const ASSEMBLY: u8 = 21;
    pub const METHOD: u8 = 22;
    pub const TYPE: u8 = 23;
    pub const MODULE: u8 = 24;
    pub const FIELD: u8 = 25;
    pub const EVENT: u8 = 64;
}

// VirtualMachine commands (set 1)
pub mod vm_commands {
    pub const VERSION: u8 = 1;
    pub const ALL_THREADS: u8 = 2;
    pub const SUSPEND: u8 = 3;
    pub const RESUME: u8 = 4;
    pub const EXIT: u8 = 5;
    pub const DISPOSE: u8 = 6;
    pub const INVOKE_METHOD: u8 = 7;
    pub const SET_PROTOCOL_VERSION: u8 = 8;
    pub const ABORT_INVOKE: u8 = 9;
    pub const SET_KEEPALIVE: u8 = 10;
    pub const GET_TYPES_FOR_SOURCE_FILE: u8 = 11;
    pub const GET_TYPES: u8 = 12;
    pub const INVOKE_METHODS: u8 = 13;
}

// ObjectReference commands (set 9)
pub mod object_commands {
    pub const GET_TYPE: u8 = 1;
    pub const GET_VALUES: u8 = 2;
    pub const IS_COLLECTED: u8 = 3;
    pub const GET_ADDRESS: u8 = 4;
    pub const GET_DOMAIN: u8 = 5;
    pub const SET_VALUES: u8 = 6;
}

// StringReference commands (set 10)
pub mod string_commands {
    pub const GET_VALUE: u8 = 1;
    pub const GET_LENGTH: u8 = 2;
    pub const GET_CHARS: u8 = 3;
}

// ThreadReference commands (set 11)
pub mod thread_commands {
    pub const GET_FRAME_INFO: u8 = 1;
    pub const GET_NAME: u8 = 2;
    pub const GET_STATE: u8 = 3;
    pub const GET_INFO: u8 = 4;
    pub const GET_ID: u8 = 5;
}

// ArrayReference commands (set 13)
pub mod array_commands {
    pub const GET_LENGTH: u8 = 1;
    pub const GET_VALUES: u8 = 2;
    pub const SET_VALUES: u8 = 3;
}

// EventRequest commands (set 15)
pub mod event_commands {
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const CLEAR_ALL_BREAKPOINTS: u8 = 3;
}

// StackFrame commands (set 16)
pub mod stack_frame_commands {
    pub const GET_VALUES: u8 = 1;
    pub const GET_THIS: u8 = 2;
    pub const SET_VALUES: u8 = 3;
    pub const GET_DOMAIN: u8 = 4;
}

// AppDomain commands (set 20)
pub mod domain_commands {
    pub const GET_ROOT_DOMAIN: u8 = 1;
    pub const GET_FRIENDLY_NAME: u8 = 2;
    pub const GET_ASSEMBLIES: u8 = 3;
    pub const GET_ENTRY_ASSEMBLY: u8 = 4;
    pub const CREATE_STRING: u8 = 5;
    pub const GET_CORLIB: u8 = 6;
}

// Assembly commands (set 21)
pub mod assembly_commands {
    pub const GET_LOCATION: u8 = 1;
    pub const GET_ENTRY_POINT: u8 = 2;
    pub const GET_MANIFEST_MODULE: u8 = 3;
    pub const GET_OBJECT: u8 = 4;
    pub const GET_TYPE: u8 = 5;
    pub const GET_NAME: u8 = 6;
}

// Method commands (set 22)
pub mod method_commands {
    pub const GET_NAME: u8 = 1;
    pub const GET_DECLARING_TYPE: u8 = 2;
    pub const GET_DEBUG_INFO: u8 = 3;
    pub const GET_PARAM_INFO: u8 = 4;
    pub const GET_LOCALS_INFO: u8 = 5;
    pub const GET_INFO: u8 = 6;
    pub const GET_CATTRS: u8 = 9;
}

// Type commands (set 23)
pub mod type_commands {
    pub const GET_INFO: u8 = 1;
    pub const GET_METHODS: u8 = 2;
    pub const GET_FIELDS: u8 = 3;
    pub const GET_VALUES: u8 = 4;
    pub const GET_OBJECT: u8 = 5;
    pub const GET_SOURCE_FILES: u8 = 6;
    pub const SET_VALUES: u8 = 7;
    pub const IS_ASSIGNABLE_FROM: u8 = 8;
    pub const GET_CATTRS: u8 = 10;
    pub const GET_FIELD_CATTRS: u8 = 11;
}

// Event set commands (set 64)
pub mod event_set_commands {
    pub const COMPOSITE: u8 = 100;
}

// Event kinds
pub mod event_kinds {
    pub const VM_START: u8 = 0;
    pub const VM_DEATH: u8 = 1;
    pub const THREAD_START: u8 = 2;
    pub const THREAD_DEATH: u8 = 3;
    pub const APPDOMAIN_CREATE: u8 = 4;
    pub const APPDOMAIN_UNLOAD: u8 = 5;
    pub const METHOD_ENTRY: u8 = 6;
    pub const METHOD_EXIT: u8 = 7;
    pub const ASSEMBLY_LOAD: u8 = 8;
    pub const ASSEMBLY_UNLOAD: u8 = 9;
    pub const BREAKPOINT: u8 = 10;
    pub const STEP: u8 = 11;
    pub const TYPE_LOAD: u8 = 12;
    pub const EXCEPTION: u8 = 13;
    pub const KEEPALIVE: u8 = 14;
    pub const USER_BREAK: u8 = 15;
    pub const USER_LOG: u8 = 16;
}

// Suspend policies
pub mod suspend_policies {
    pub const NONE: u8 = 0;
    pub const EVENT_THREAD: u8 = 1;
    pub const ALL: u8 = 2;
}

// Modifier kinds for EventRequest.Set
pub mod modifier_kinds {
    pub const COUNT: u8 = 1;
    pub const THREAD_ONLY: u8 = 3;
    pub const LOCATION_ONLY: u8 = 7;
    pub const EXCEPTION_ONLY: u8 = 8;
    pub const STEP: u8 = 10;
    pub const ASSEMBLY_ONLY: u8 = 11;
    pub const SOURCE_FILE_ONLY: u8 = 12;
    pub const TYPE_NAME_ONLY: u8 = 13;
}

// Element type tags for values
pub mod element_types {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const VALUE_TYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const ARRAY: u8 = 0x14;
    pub const GENERIC_INST: u8 = 0x15;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const OBJECT: u8 = 0x1c;
    pub const SZ_ARRAY: u8 = 0x1d;

    // Value-only tags
    pub const NULL: u8 = 0xf0;
    pub const TYPE: u8 = 0xf1;
}

// Invoke flags for VirtualMachine.InvokeMethod
pub mod invoke_flags {
    pub const NONE: i32 = 0;
    pub const DISABLE_BREAKPOINTS: i32 = 1;
    pub const SINGLE_THREADED: i32 = 2;
    pub const OUT_THIS: i32 = 4;
    pub const OUT_ARGS: i32 = 8;
    pub const VIRTUAL: i32 = 16;
}

// Result flags byte in an InvokeMethod reply
pub mod invoke_result_flags {
    pub const EXCEPTION: u8 = 0x01;
    pub const THIS_UPDATED: u8 = 0x02;
    pub const ARGS_UPDATED: u8 = 0x04;
}

// Step sizes
pub mod step_sizes {
    pub const MIN: i32 = 0;
    pub const LINE: i32 = 1;
}

// Step depths
pub mod step_depths {
    pub const INTO: i32 = 0;
    pub const OVER: i32 = 1;
    pub const OUT: i32 = 2;
}

// Step filter bits
pub mod step_filters {
    pub const NONE: i32 = 0;
    pub const STATIC_CTOR: i32 = 1;
    pub const DEBUGGER_HIDDEN: i32 = 2;
    pub const DEBUGGER_STEP_THROUGH: i32 = 4;
    pub const DEBUGGER_NON_USER_CODE: i32 = 8;
}
