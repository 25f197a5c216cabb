//! Public error taxonomy and classification of storage-engine errors.
//!
//! Every error that leaves the query service carries one of the RPC codes
//! below. Storage-engine errors arrive as [`SqlError`] (errno + sqlstate) and
//! are classified into the taxonomy by [`convert_error_code`].

use std::fmt;

use thiserror::Error;

use crate::types::BindVars;

/// The public RPC code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    ResourceExhausted,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error reported by the backing storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub num: u16,
    pub sql_state: String,
    pub message: String,
}

impl SqlError {
    pub fn new(num: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            num,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (errno {}) (sqlstate {})",
            self.message, self.num, self.sql_state
        )
    }
}

/// The error type returned by every query-service operation.
///
/// A composed call (begin-execute, reserve-execute) that fails after it
/// already created a transaction or pinned a connection does not destroy
/// them; the surviving ids ride on the error so the caller can retry on
/// the same connection or resolve the transaction explicitly.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TabletError {
    code: ErrorCode,
    message: String,
    sql_error: Option<SqlError>,
    transaction_id: i64,
    reserved_id: i64,
}

impl TabletError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sql_error: None,
            transaction_id: 0,
            reserved_id: 0,
        }
    }

    pub fn sql(err: SqlError) -> Self {
        Self {
            code: ErrorCode::Unknown,
            message: err.message.clone(),
            sql_error: Some(err),
            transaction_id: 0,
            reserved_id: 0,
        }
    }

    /// Same storage error, but carrying an explicit upstream code.
    pub fn sql_with_code(code: ErrorCode, err: SqlError) -> Self {
        Self {
            code,
            message: err.message.clone(),
            sql_error: Some(err),
            transaction_id: 0,
            reserved_id: 0,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn sql_error(&self) -> Option<&SqlError> {
        self.sql_error.as_ref()
    }

    /// Transaction that outlived a failed composed call, zero otherwise.
    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    /// Connection still pinned after a failed composed call, zero otherwise.
    pub fn reserved_id(&self) -> i64 {
        self.reserved_id
    }

    pub(crate) fn with_message(mut self, message: String) -> Self {
        self.message = message;
        self
    }

    pub(crate) fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub(crate) fn with_transaction_id(mut self, transaction_id: i64) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub(crate) fn with_reserved_id(mut self, reserved_id: i64) -> Self {
        self.reserved_id = reserved_id;
        self
    }
}

/// Storage-engine error numbers this node knows how to classify. The set is
/// representative; unmatched numbers keep the upstream code.
pub mod errno {
    pub const ER_DISK_FULL: u16 = 1021;
    pub const ER_OUT_OF_MEMORY: u16 = 1037;
    pub const ER_OUT_OF_SORTMEMORY: u16 = 1038;
    pub const ER_CON_COUNT: u16 = 1040;
    pub const ER_OUT_OF_RESOURCES: u16 = 1041;
    pub const ER_BAD_DB: u16 = 1049;
    pub const ER_TABLE_EXISTS: u16 = 1050;
    pub const ER_BAD_TABLE: u16 = 1051;
    pub const ER_NON_UNIQ: u16 = 1052;
    pub const ER_SERVER_SHUTDOWN: u16 = 1053;
    pub const ER_BAD_FIELD_ERROR: u16 = 1054;
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_EMPTY_QUERY: u16 = 1065;
    pub const ER_GOT_SIGNAL: u16 = 1078;
    pub const ER_FORCING_CLOSE: u16 = 1080;
    pub const ER_NO_SUCH_INDEX: u16 = 1082;
    pub const ER_FILE_EXISTS: u16 = 1086;
    pub const ER_UNKNOWN_TABLE: u16 = 1109;
    pub const ER_RECORD_FILE_FULL: u16 = 1114;
    pub const ER_UDF_EXISTS: u16 = 1125;
    pub const ER_WRONG_VALUE_COUNT_ON_ROW: u16 = 1136;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_SYNTAX_ERROR: u16 = 1149;
    pub const ER_ABORTING_CONNECTION: u16 = 1152;
    pub const ER_DUP_UNIQUE: u16 = 1169;
    pub const ER_REQUIRES_PRIMARY_KEY: u16 = 1173;
    pub const ER_KEY_DOES_NOT_EXIST: u16 = 1176;
    pub const ER_CANT_DO_THIS_DURING_TRANSACTION: u16 = 1179;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_TABLE_FULL: u16 = 1206;
    pub const ER_READ_ONLY_TRANSACTION: u16 = 1207;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
    pub const ER_SPECIFIED_ACCESS_DENIED: u16 = 1227;
    pub const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;
    pub const ER_TOO_MANY_USER_CONNECTIONS: u16 = 1203;
    pub const ER_USER_LIMIT_REACHED: u16 = 1226;
    pub const ER_DB_ACCESS_DENIED: u16 = 1044;
    pub const ER_ACCESS_DENIED: u16 = 1045;
    pub const ER_NO_DB: u16 = 1046;
    pub const ER_KILL_DENIED: u16 = 1095;
    pub const ER_KEY_NOT_FOUND: u16 = 1032;
    pub const ER_DATA_TOO_LONG: u16 = 1406;
    pub const ER_TRUNCATED_WRONG_VALUE: u16 = 1292;
    pub const ER_WARN_DATA_OUT_OF_RANGE: u16 = 1264;
    pub const ER_UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;
    pub const ER_WRONG_ARGUMENTS: u16 = 1210;
    pub const CR_SERVER_GONE: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
}

/// Map a tablet error to its public code, classifying any embedded storage
/// error by errno. Errors without a storage component keep their code.
pub fn convert_error_code(err: &TabletError) -> ErrorCode {
    use errno::*;

    let sql_err = match err.sql_error() {
        Some(e) => e,
        None => return err.code(),
    };

    match sql_err.num {
        ER_NOT_SUPPORTED_YET => ErrorCode::Unimplemented,
        ER_DISK_FULL | ER_OUT_OF_MEMORY | ER_OUT_OF_SORTMEMORY | ER_CON_COUNT
        | ER_OUT_OF_RESOURCES | ER_RECORD_FILE_FULL | ER_TOO_MANY_USER_CONNECTIONS
        | ER_LOCK_TABLE_FULL | ER_USER_LIMIT_REACHED => ErrorCode::ResourceExhausted,
        ER_LOCK_WAIT_TIMEOUT => ErrorCode::DeadlineExceeded,
        CR_SERVER_GONE | ER_SERVER_SHUTDOWN => ErrorCode::Unavailable,
        ER_KEY_NOT_FOUND | ER_BAD_FIELD_ERROR | ER_UNKNOWN_TABLE | ER_NO_SUCH_TABLE
        | ER_KEY_DOES_NOT_EXIST => ErrorCode::NotFound,
        ER_DB_ACCESS_DENIED | ER_ACCESS_DENIED | ER_KILL_DENIED => ErrorCode::PermissionDenied,
        ER_NO_DB | ER_NO_SUCH_INDEX | ER_DUP_UNIQUE | ER_REQUIRES_PRIMARY_KEY
        | ER_CANT_DO_THIS_DURING_TRANSACTION | ER_READ_ONLY_TRANSACTION
        | ER_WARN_DATA_OUT_OF_RANGE => ErrorCode::FailedPrecondition,
        ER_OPTION_PREVENTS_STATEMENT => {
            // Likely a failover: the old master went read-only while clients
            // are still connected.
            if sql_err.message.contains("read-only") {
                ErrorCode::FailedPrecondition
            } else {
                err.code()
            }
        }
        ER_TABLE_EXISTS | ER_DUP_ENTRY | ER_FILE_EXISTS | ER_UDF_EXISTS => ErrorCode::AlreadyExists,
        ER_GOT_SIGNAL | ER_FORCING_CLOSE | ER_ABORTING_CONNECTION | ER_LOCK_DEADLOCK => {
            ErrorCode::Aborted
        }
        ER_BAD_DB | ER_BAD_TABLE | ER_NON_UNIQ | ER_PARSE_ERROR | ER_EMPTY_QUERY
        | ER_SYNTAX_ERROR | ER_WRONG_VALUE_COUNT_ON_ROW | ER_DATA_TOO_LONG
        | ER_TRUNCATED_WRONG_VALUE | ER_UNKNOWN_SYSTEM_VARIABLE | ER_WRONG_ARGUMENTS => {
            ErrorCode::InvalidArgument
        }
        ER_SPECIFIED_ACCESS_DENIED => {
            if sql_err.message.contains("failover in progress") {
                ErrorCode::FailedPrecondition
            } else {
                ErrorCode::PermissionDenied
            }
        }
        CR_SERVER_LOST => ErrorCode::Canceled,
        _ => err.code(),
    }
}

/// Readable version of a query plus its bind variables, sorted by key.
pub fn query_as_string(sql: &str, bind_vars: &BindVars) -> String {
    let mut out = format!("Sql: {sql:?}, BindVars: {{");
    for (key, value) in bind_vars {
        out.push_str(&format!("{key}: {:?}", value.as_raw_string()));
    }
    out.push('}');
    out
}

/// Log form of a query and its bind variables, truncated to `max_len`
/// (0 disables truncation).
pub fn truncate_sql_and_binds(sql: &str, bind_vars: &BindVars, max_len: usize) -> String {
    let truncated_query = truncate_marked(sql, max_len);
    let mut bv = String::from("BindVars: {");
    for (key, value) in bind_vars {
        bv.push_str(&format!("{key}: {:?}", value.as_raw_string()));
    }
    bv.push('}');
    let bv = truncate_marked(&bv, max_len);
    format!("Sql: {truncated_query:?}, {bv}")
}

fn truncate_marked(text: &str, max_len: usize) -> String {
    if max_len == 0 || text.len() <= max_len {
        return text.to_string();
    }
    let mut cut = max_len.saturating_sub(12);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{} [TRUNCATED]", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn sql_tablet_error(num: u16, message: &str) -> TabletError {
        TabletError::sql(SqlError::new(num, "HY000", message))
    }

    #[test]
    fn errno_classification_table() {
        let cases: &[(u16, &str, ErrorCode)] = &[
            (errno::ER_NOT_SUPPORTED_YET, "nope", ErrorCode::Unimplemented),
            (errno::ER_DISK_FULL, "disk full", ErrorCode::ResourceExhausted),
            (errno::ER_LOCK_WAIT_TIMEOUT, "lock wait", ErrorCode::DeadlineExceeded),
            (errno::CR_SERVER_GONE, "gone", ErrorCode::Unavailable),
            (errno::ER_NO_SUCH_TABLE, "no table", ErrorCode::NotFound),
            (errno::ER_ACCESS_DENIED, "denied", ErrorCode::PermissionDenied),
            (errno::ER_DUP_ENTRY, "dup", ErrorCode::AlreadyExists),
            (errno::ER_LOCK_DEADLOCK, "deadlock", ErrorCode::Aborted),
            (errno::ER_PARSE_ERROR, "parse", ErrorCode::InvalidArgument),
            (errno::CR_SERVER_LOST, "killed", ErrorCode::Canceled),
        ];
        for (num, message, want) in cases {
            let err = sql_tablet_error(*num, message);
            assert_eq!(convert_error_code(&err), *want, "errno {num}");
        }
    }

    #[test]
    fn read_only_text_promotes_to_failed_precondition() {
        let err = sql_tablet_error(
            errno::ER_OPTION_PREVENTS_STATEMENT,
            "The MySQL server is running with the --read-only option",
        );
        assert_eq!(convert_error_code(&err), ErrorCode::FailedPrecondition);

        let other = sql_tablet_error(errno::ER_OPTION_PREVENTS_STATEMENT, "blocked by option");
        assert_eq!(convert_error_code(&other), ErrorCode::Unknown);
    }

    #[test]
    fn specified_access_denied_splits_on_failover_text() {
        let failover = sql_tablet_error(errno::ER_SPECIFIED_ACCESS_DENIED, "failover in progress");
        assert_eq!(convert_error_code(&failover), ErrorCode::FailedPrecondition);

        let denied = sql_tablet_error(errno::ER_SPECIFIED_ACCESS_DENIED, "not allowed");
        assert_eq!(convert_error_code(&denied), ErrorCode::PermissionDenied);
    }

    #[test]
    fn unmatched_errno_keeps_upstream_code() {
        let err = TabletError::sql_with_code(
            ErrorCode::Internal,
            SqlError::new(9999, "HY000", "mystery"),
        );
        assert_eq!(convert_error_code(&err), ErrorCode::Internal);
    }

    #[test]
    fn plain_error_keeps_its_code() {
        let err = TabletError::new(ErrorCode::FailedPrecondition, "not serving");
        assert_eq!(convert_error_code(&err), ErrorCode::FailedPrecondition);
    }

    #[test]
    fn query_as_string_sorts_binds() {
        let mut binds = BindVars::new();
        binds.insert("b".to_string(), Value::Int(2));
        binds.insert("a".to_string(), Value::VarChar("x".to_string()));
        let formatted = query_as_string("select 1", &binds);
        assert!(formatted.contains("a: \"x\""));
        let a_pos = formatted.find("a:").unwrap();
        let b_pos = formatted.find("b:").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn truncation_marks_long_queries() {
        let binds = BindVars::new();
        let long_sql = "select ".repeat(100);
        let formatted = truncate_sql_and_binds(&long_sql, &binds, 64);
        assert!(formatted.contains("[TRUNCATED]"));
        assert!(formatted.len() < long_sql.len());
    }
}
