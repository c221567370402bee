pub mod handle;
pub mod helpers;
pub mod messages;
pub mod result;

pub use handle::{ChannelHandle, ConnectionHandle, RecognitionInfo};
pub use helpers::ByteHandle;
pub use messages::{
    AuthenticationProtocolData, DidAuthenticate, DidAuthenticateResponse, FunctionType, Hash,
    HashResponse, InputApduInfo, SalRequest, SalResponse, Sign, SignResponse, StartPaos,
    StartPaosResponse, Transmit, TransmitResponse, UserAgent,
};
pub use result::{check_result, ResultError, ResultType};
