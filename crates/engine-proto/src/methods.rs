//! Method-name strings for every operation on the channel.

pub const INITIALIZE: &str = "initialize";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";

pub const READ_DOCUMENT: &str = "readDocument";
pub const CLOSE_DOCUMENT: &str = "closeDocument";
pub const RETRIEVE_SAMPLE_SOURCES: &str = "retrieveSampleSources";
pub const RETRIEVE_SESSION_INFO: &str = "retrieveSessionInfo";
pub const RETRIEVE_SYSTEM_INFO: &str = "retrieveSystemInfo";
pub const RETRIEVE_PROCESSES: &str = "retrieveProcesses";
pub const SET_SAMPLE_FILTERS: &str = "setSampleFilters";
pub const RETRIEVE_HOTTEST_FUNCTIONS: &str = "retrieveHottestFunctions";
pub const RETRIEVE_PROCESS_SAMPLE_INFO: &str = "retrieveProcessSampleInfo";
pub const RETRIEVE_CALL_TREE_HOT_PATH: &str = "retrieveCallTreeHotPath";
pub const RETRIEVE_FUNCTIONS_PAGE: &str = "retrieveFunctionsPage";
pub const EXPAND_CALL_TREE_NODE: &str = "expandCallTreeNode";
pub const RETRIEVE_CALLERS_CALLEES: &str = "retrieveCallersCallees";
pub const RETRIEVE_LINE_INFO: &str = "retrieveLineInfo";

pub const SET_MODULE_PATH_MAPS: &str = "setModulePathMaps";
pub const SET_PDB_SYMBOL_FIND_OPTIONS: &str = "setPdbSymbolFindOptions";
pub const SET_DWARF_SYMBOL_FIND_OPTIONS: &str = "setDwarfSymbolFindOptions";
pub const SET_MODULE_FILTERS: &str = "setModuleFilters";

pub const PROGRESS: &str = "$/progress";
pub const CANCEL_REQUEST: &str = "$/cancelRequest";
