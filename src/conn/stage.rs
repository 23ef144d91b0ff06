//! Protocol phases of a connection and the readiness bookkeeping the event
//! loop shares with the I/O passes.

use bitflags::bitflags;

/// Phase of the per-connection protocol state machine.
///
/// One request/response round-trip walks from `Init` to `FullReplySent`,
/// then either re-enters `Init` (keep-alive) or falls through `PreClosing`
/// to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Init,

    ReqLineReceiving,
    ReqLineReceived,
    HeadersReceiving,
    HeadersReceived,
    HeadersProcessed,
    BodyReceiving,
    BodyReceived,
    FootersReceiving,
    FootersReceived,
    FullReqReceived,
    ReqRecvFinished,

    /// Transmitting the interim `100 Continue` before body reception.
    ContinueSending,

    StartReply,
    HeadersSending,
    HeadersSent,
    UnchunkedBodyUnready,
    UnchunkedBodyReady,
    ChunkedBodyUnready,
    ChunkedBodyReady,
    ChunkedBodySent,
    FootersSending,
    FullReplySent,

    UpgradeHeadersSending,
    Upgrading,
    Upgraded,
    UpgradedCleaning,

    PreClosing,
    Closed,
}

impl Stage {
    /// Stages that consume bytes from the socket.
    pub(crate) fn consumes_input(self) -> bool {
        matches!(
            self,
            Stage::Init
                | Stage::ReqLineReceiving
                | Stage::ReqLineReceived
                | Stage::HeadersReceiving
                | Stage::HeadersReceived
                | Stage::HeadersProcessed
                | Stage::BodyReceiving
                | Stage::BodyReceived
                | Stage::FootersReceiving
                | Stage::FootersReceived
        )
    }

    /// Stages that push bytes toward the socket.
    pub(crate) fn produces_output(self) -> bool {
        matches!(
            self,
            Stage::ContinueSending
                | Stage::HeadersSending
                | Stage::UnchunkedBodyReady
                | Stage::ChunkedBodyReady
                | Stage::ChunkedBodySent
                | Stage::FootersSending
                | Stage::UpgradeHeadersSending
        )
    }

    /// Stages in the reply-transmission family.
    pub(crate) fn is_sending_reply(self) -> bool {
        matches!(
            self,
            Stage::HeadersSending
                | Stage::HeadersSent
                | Stage::UnchunkedBodyUnready
                | Stage::UnchunkedBodyReady
                | Stage::ChunkedBodyUnready
                | Stage::ChunkedBodyReady
                | Stage::ChunkedBodySent
                | Stage::FootersSending
                | Stage::UpgradeHeadersSending
        )
    }
}

bitflags! {
    /// Cached view of the last readiness report for the socket.
    ///
    /// Set by the poller, cleared by the I/O passes on short reads/writes
    /// so edge-triggered backends know when to wait again.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Readiness: u8 {
        const RECV_READY  = 0b001;
        const SEND_READY  = 0b010;
        const ERROR_READY = 0b100;
    }
}

/// What happens to the connection once the current reply is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAlive {
    MustClose,
    MayReuse,
    MustUpgrade,
}
