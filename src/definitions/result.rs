use serde::{Deserialize, Serialize};

/// Result major URIs from the eCard-API framework.
pub mod major {
    pub const OK: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#ok";
    pub const ERROR: &str = "http://www.bsi.bund.de/ecard/api/1.1/resultmajor#error";
}

/// Result minor URIs used by the engine itself. Concrete protocols bring
/// their own.
pub mod minor {
    pub const INCORRECT_PARAMETER: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#incorrectParameter";
    pub const INTERNAL_ERROR: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/al/common#internalError";
    pub const COMMUNICATION_ERROR: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/dp#communicationError";
    pub const INAPPROPRIATE_PROTOCOL_FOR_ACTION: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/sal#inappropriateProtocolForAction";
    pub const UNKNOWN_CONNECTION_HANDLE: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/sal#unknownConnectionHandle";
    pub const UNKNOWN_PROTOCOL: &str =
        "http://www.bsi.bund.de/ecard/api/1.1/resultminor/sal#unknownProtocol";
}

/// Embedded result status of a response message (`dss:Result`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultType {
    pub result_major: String,
    pub result_minor: Option<String>,
    pub result_message: Option<String>,
}

impl ResultType {
    pub fn ok() -> Self {
        ResultType {
            result_major: major::OK.to_string(),
            result_minor: None,
            result_message: None,
        }
    }

    pub fn error(minor: &str, message: impl Into<String>) -> Self {
        ResultType {
            result_major: major::ERROR.to_string(),
            result_minor: Some(minor.to_string()),
            result_message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result_major == major::OK
    }
}

impl Default for ResultType {
    fn default() -> Self {
        ResultType::ok()
    }
}

/// A non-ok embedded result, surfaced as a typed error by [`check_result`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("response carried an error result ({})", .minor.as_deref().unwrap_or("no minor code"))]
pub struct ResultError {
    pub minor: Option<String>,
    pub message: Option<String>,
}

/// Fails when the given result reports anything but ok.
///
/// Callers must not infer success from message receipt alone; every embedded
/// result is checked through here.
pub fn check_result(result: &ResultType) -> Result<(), ResultError> {
    if result.is_ok() {
        Ok(())
    } else {
        Err(ResultError {
            minor: result.result_minor.clone(),
            message: result.result_message.clone(),
        })
    }
}
