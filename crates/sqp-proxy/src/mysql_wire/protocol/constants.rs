//! MySQL client/server protocol constants
//!
//! Command bytes, reply markers, capability and status flags.

/// Frame header: 3-byte little-endian length + 1-byte sequence
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

// Command bytes (first payload byte of a client command frame)
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_FIELD_LIST: u8 = 0x04;
pub const COM_STATISTICS: u8 = 0x09;
pub const COM_PING: u8 = 0x0e;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;

// Reply markers (first payload byte of a server reply)
pub const OK_HEADER: u8 = 0x00;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
pub const LOCAL_INFILE_HEADER: u8 = 0xfb;
pub const EOF_HEADER: u8 = 0xfe;
pub const ERR_HEADER: u8 = 0xff;

/// EOF packets are always shorter than this
pub const EOF_MAX_LEN: usize = 9;

/// caching_sha2_password "fast auth success" marker following 0x01
pub const FAST_AUTH_SUCCESS: u8 = 0x03;

// Capability flags
pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_DATA: u32 = 0x0020_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

/// Capabilities the proxy advertises to clients
pub const PROXY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_LOCAL_FILES
    | CLIENT_PROTOCOL_41
    | CLIENT_INTERACTIVE
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_DATA;

/// Capabilities never forwarded to a backend: the proxy must see plain
/// EOF-terminated result sets on every replica.
pub const STRIPPED_CAPABILITIES: u32 =
    CLIENT_SSL | CLIENT_COMPRESS | CLIENT_DEPRECATE_EOF | CLIENT_CONNECT_ATTRS;

// Status flags
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

/// utf8mb4_general_ci
pub const DEFAULT_CHARSET: u8 = 45;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Version string sent in the proxy's greeting
pub const SERVER_VERSION: &str = "5.7.30-sqp";

/// Length of the auth scramble (8 + 12 bytes)
pub const SCRAMBLE_LEN: usize = 20;

// Error codes used by the listener
pub const ER_CON_COUNT_ERROR: u16 = 1040;
pub const ER_HOST_IS_BLOCKED: u16 = 1129;
pub const ER_HANDSHAKE_ERROR: u16 = 1043;
