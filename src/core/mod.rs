pub mod backpressure;
pub mod barge_in;
pub mod bridge;
pub mod codec;
pub mod directory;
pub mod hangup;
pub mod outbound;
pub mod persistence;
pub mod provider;
pub mod session;
pub mod telephony;

// Re-export commonly used types for convenience
pub use backpressure::{BackpressureGovernor, TurnGuard};
pub use barge_in::{BargeInConfig, BargeInController, BargeInState, InterruptEffects};
pub use bridge::{
    BridgeError, BridgeOptions, CallBridge, CallStart, DefaultProviderFactory, OutboundSlots,
    ProviderFactory,
};
pub use codec::{AudioFormat, CodecError, FrameCodec};
pub use directory::{
    BusinessConfig, CallDirectory, DirectoryError, HttpCallDirectory, StaticCallDirectory,
};
pub use hangup::{DrainConfig, HangupAction, HangupOutcome, HangupSequencer};
pub use outbound::{
    AcquireOutcome, MemorySlotStore, OutboundConfig, OutboundDispatcher, OutboundSemaphore,
    SlotStore, SlotStoreError,
};
pub use persistence::{CallOutcome, EndReason, PersistenceSink, TracingSink, WebhookSink};
pub use provider::{
    AiProvider, ProviderClient, ProviderError, ProviderEvent, ProviderSettings, create_provider,
    get_supported_providers,
};
pub use session::{AudioFrame, CallSession, FrameQueue};
pub use telephony::{TelephonyCommand, TelephonyEvent};
