// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Video service protocol for axon environments
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (wire layout), Experimental (server)
//! TEST_COVERAGE: Unit tests (wire, server), loopback client property test
//!
//! PUBLIC API:
//!   - wire: Page, Request, Response, RequestKind, UPDATE_CHUNK
//!   - client: Transport, IpcTransport, VideoClient
//!   - server: Framebuffer, VecFramebuffer, VideoServer
//!
//! DEPENDENCIES:
//!   - axon-abi: syscall wrappers used by IpcTransport
//!
//! INVARIANTS:
//!   - Every request and response fits in exactly one page
//!   - Pixel uploads larger than one page are split into offset/length chunks
//!
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

extern crate alloc;

pub mod client;
pub mod server;
pub mod wire;

pub use client::{IpcTransport, Transport, VideoClient};
pub use server::{Framebuffer, VecFramebuffer, VideoServer};
pub use wire::{Page, Request, RequestKind, Response, UPDATE_CHUNK};

use axon_abi::Errno;

/// Failure reported by the video server, or by the IPC path to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VideoError {
    /// The server could not create the window.
    #[error("window create failed")]
    WindowCreate,
    /// The server could not create the texture.
    #[error("texture create failed")]
    TextureCreate,
    /// A texture upload chunk was rejected.
    #[error("texture update failed")]
    TextureUpdate,
    /// The server could not create the renderer.
    #[error("renderer create failed")]
    RendererCreate,
    /// Unknown request kind, bad handle or malformed page.
    #[error("invalid request")]
    InvalidRequest,
    /// The request never reached the server.
    #[error("ipc failed: {0}")]
    Ipc(Errno),
}

impl VideoError {
    /// Status word the server replies with (always negative).
    pub fn status(self) -> i32 {
        match self {
            Self::WindowCreate => -1,
            Self::TextureCreate => -2,
            Self::TextureUpdate => -3,
            Self::RendererCreate => -4,
            Self::InvalidRequest | Self::Ipc(_) => -5,
        }
    }

    /// Interprets a status word: 0 is success.
    pub fn from_status(status: i32) -> Result<(), Self> {
        match status {
            0 => Ok(()),
            -1 => Err(Self::WindowCreate),
            -2 => Err(Self::TextureCreate),
            -3 => Err(Self::TextureUpdate),
            -4 => Err(Self::RendererCreate),
            _ => Err(Self::InvalidRequest),
        }
    }
}

/// How a window's back buffer is placed on the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum WindowMode {
    /// Top-left corner, unscaled.
    Corner = 0,
    /// Stretched over the whole display.
    Fullscreen = 1,
    /// Centered, unscaled.
    Centered = 2,
    /// Top-left corner, every pixel doubled.
    Scale2x = 3,
}

impl WindowMode {
    /// Decodes a wire value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Corner,
            1 => Self::Fullscreen,
            2 => Self::Centered,
            3 => Self::Scale2x,
            _ => return None,
        })
    }
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(core::num::NonZeroU64);

        impl $name {
            /// Decodes a wire value; 0 is never a valid handle.
            pub fn from_raw(raw: u64) -> Option<Self> {
                core::num::NonZeroU64::new(raw).map(Self)
            }

            /// Returns the wire value.
            pub fn raw(self) -> u64 {
                self.0.get()
            }
        }
    };
}

handle!(
    /// Server-side window object.
    WindowHandle
);
handle!(
    /// Server-side texture object.
    TextureHandle
);
handle!(
    /// Server-side renderer (back buffer bound to a window).
    RendererHandle
);
