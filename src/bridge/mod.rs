//! ニコ生ブリッジ
//!
//! 1 放送につき 1 つの [`BridgeSession`] が、コントロールチャネルと
//! NDGR ストリームパイプラインを束ね、重複排除・レート制限を通したコメントを
//! オーナーへ届ける。

pub mod backoff;
pub mod error;
pub mod events;
pub mod ledger;
pub mod pipeline;
pub mod session;

pub use backoff::Backoff;
pub use error::BridgeError;
pub use events::{
    BridgeComment, BridgeEvents, BridgeObserver, BridgeState, BridgeStatus, ChannelObserver,
    PROGRAM_ENDED_MESSAGE,
};
pub use ledger::{BoundedSet, CommentVerdict, Ledger, SegmentVerdict};
pub use pipeline::StreamPipeline;
pub use session::{BridgeSession, SessionTransport};
