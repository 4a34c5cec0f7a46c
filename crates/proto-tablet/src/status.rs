/// The closed status-code set shared by shard and executer responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Unspecified = 0,
    Success = 1,
    BadRequest = 2,
    SchemeError = 3,
    Unauthorized = 4,
    Unsupported = 5,
    NotFound = 6,
    Aborted = 7,
    Overloaded = 8,
    Unavailable = 9,
    Timeout = 10,
    Cancelled = 11,
    PreconditionFailed = 12,
    GenericError = 13,
    Undetermined = 14,
    InternalError = 15,
    AlreadyExists = 16,
    BadSession = 17,
}

/// Machine-readable issue codes attached to failure statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IssueCode {
    Unspecified = 0,
    LocksInvalidated = 1,
    TxDeclinedImplicitCoordinator = 2,
    TxStateUnknown = 3,
    ResultUnavailable = 4,
    Overloaded = 5,
    OperationAborted = 6,
    TemporarilyUnavailable = 7,
    OperationCancelled = 8,
    BadRequest = 9,
    PreconditionFailed = 10,
    SchemeMismatch = 11,
    OperationStateUnknown = 12,
    Default = 13,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Issue {
    #[prost(enumeration = "IssueCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub sub_issues: ::prost::alloc::vec::Vec<Issue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(message, repeated, tag = "2")]
    pub issues: ::prost::alloc::vec::Vec<Issue>,
}

impl Issue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self { code: code as i32, message: message.into(), sub_issues: Vec::new() }
    }

    pub fn with_sub(mut self, sub: Issue) -> Self {
        self.sub_issues.push(sub);
        self
    }
}

impl Status {
    pub fn success() -> Self {
        Self { code: StatusCode::Success as i32, issues: Vec::new() }
    }

    pub fn error(code: StatusCode, issue: Issue) -> Self {
        Self { code: code as i32, issues: vec![issue] }
    }

    pub fn with_code(code: StatusCode) -> Self {
        Self { code: code as i32, issues: Vec::new() }
    }

    pub fn is_success(&self) -> bool {
        self.code() == StatusCode::Success
    }
}
