#![allow(clippy::too_many_arguments)]

extern crate reqwest;
extern crate serde;
extern crate serde_json;
extern crate serde_repr;
extern crate url;

pub mod bitmask;
pub mod broadcast;
pub mod buffer;
pub mod client;
pub mod config;
pub mod errors;
pub mod feed;
pub mod logging;
pub mod mirror;
pub mod picking;
pub mod population;
pub mod protocol;
pub mod record;
pub mod server;
pub mod signals;
pub(crate) mod timings;
pub mod types;

pub use bitmask::{decode_visual, MetaCodec, MetaFields, MetaLayout, Trend, VisualAttrs};
pub use broadcast::{Broadcaster, CycleOutcome, Hub, OutboundQueue, SubscriptionFilter};
pub use buffer::{PointBuffer, Snapshot};
pub use client::{MirrorClient, MirrorClientConfig, MirrorEvent};
pub use config::RiskfieldConfig;
pub use errors::{
    ClientError, ClientResult, ContractError, ContractResult, FeedError, FeedResult, PickError,
    ServerError, ServerResult,
};
pub use feed::{
    ExponentialBackoff, FeedPoller, HttpPriceSource, PriceInbox, PriceSource, SyntheticConfig,
    SyntheticPriceSource,
};
pub use mirror::Mirror;
pub use picking::{Pick, PickingHandle, ScreenTransform, SelectionEvent, SpatialGrid};
pub use population::{InstrumentSpec, Population};
pub use protocol::{ClientMessage, Metadata, ServerMessage, SubscribeRequest};
pub use record::{DiffEntry, Encoding, EntityRecord};
pub use server::{RiskfieldServer, ServerConfig};
pub use signals::{EngineConfig, Rejection, SignalEngine, TickReport};
pub use types::{EntityIndex, MacroPressure, Observation, PriceBatch, WorldPoint};
