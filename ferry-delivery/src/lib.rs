pub mod address_map;
pub mod bounce;
pub mod config;
pub mod error;
pub mod message;
pub mod notify;
pub mod rewrite;
pub mod sender;
pub mod transport;

pub use address_map::{AddressMap, BounceRule, Resolution};
pub use bounce::{BounceGenerator, BounceMessage, BounceReason, BounceRequest, Suppression};
pub use config::{RelayIdentity, RewriteConfig};
pub use error::{BounceError, MapLoadError, NotifyError, RewriteError, TransportError};
pub use notify::{BounceEvent, ChannelNotifier, LogNotifier, NotificationConfig, Notifier, WebhookNotifier};
pub use rewrite::{Rewriter, RewrittenMessage};
pub use sender::{RelayOutcome, RelaySender, RelayStatus};
pub use transport::{
    MemoryTransport, OutboundMessage, SmtpTimeouts, SmtpTransport, SmtpTransportConfig, Transport,
    TransportConfig, TransportReceipt,
};
