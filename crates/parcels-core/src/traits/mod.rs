//! Core traits for the parcel tracking system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`TrackingApi`]: Talk to the remote tracking service
//! - [`StateStore`]: Durable storage of the record set

pub mod tracking_api;
pub mod state_store;

pub use tracking_api::{
    ApiStatusSnapshot, InitResult, PollResult, ShipmentPayload, TrackingApi, TrackingApiFactory,
};
pub use state_store::{StateStore, StateStoreFactory};
