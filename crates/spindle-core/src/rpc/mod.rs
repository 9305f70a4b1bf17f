//! RPC - タスクコード単位のハンドラ表と呼び出し
//!
//! Every call is a pending `Task<Message>` that the dispatcher completes
//! with the reply, a timeout, or a transport failure, whichever comes first.

pub mod dispatcher;
pub mod handler;

pub use self::dispatcher::{
    Dispatcher, LateReplyPolicy, ResponseCallback, RpcConfig, RpcResponseTask,
};
pub use self::handler::{RpcContext, RpcHandler};
