//! Data channel surface.

mod data_channel;

pub use data_channel::{DataChannelInit, DataChannelState, RtcDataChannel};
