//! # castssdp - SSDP discovery for CastLink
//!
//! This crate implements the SSDP (Simple Service Discovery Protocol) side of
//! CastLink: sending M-SEARCH queries, listening for unsolicited NOTIFY
//! announcements, and resolving each announced service to its description
//! document.
//!
//! ## Architecture
//!
//! - [`SsdpDiscoveryProvider`] : the discovery engine (search, receive loops,
//!   description resolution, per-filter event fan-out)
//! - [`ServiceAnnouncement`] / [`DiscoveryFilter`] : the vocabulary shared
//!   with the device registry
//! - [`DiscoveryProvider`] / [`DiscoveryProviderListener`] : the seam a
//!   registry composes providers through
//!
//! ## Constants
//!
//! - **Multicast Address**: 239.255.255.250:1900
//! - **Max-Age**: 1800 seconds unless the announcement says otherwise

mod announcement;
mod description;
mod message;
mod provider;

pub use announcement::{
    DiscoveryFilter, DiscoveryProvider, DiscoveryProviderListener, ServiceAnnouncement,
};
pub use description::{DescribedService, DescriptionError, DeviceDescription};
pub use message::{SsdpPacket, SsdpPacketKind, extract_uuid, search_message};
pub use provider::SsdpDiscoveryProvider;

/// SSDP multicast group address
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";

/// SSDP port
pub const SSDP_PORT: u16 = 1900;

/// Announcement validity when no CACHE-CONTROL is present (seconds)
pub const DEFAULT_MAX_AGE: u32 = 1800;

/// Port assigned to a service before its description document resolves
pub const DEFAULT_CONTROL_PORT: u16 = 3001;

/// MX value sent in M-SEARCH requests
pub const SEARCH_MX: u32 = 5;
