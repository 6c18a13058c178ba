// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One-page request/response layout of the video service.
//!
//! The request kind travels as the IPC value; the page carries the request fields and,
//! after the reply, the response fields. All integers are little-endian at fixed offsets:
//!
//! | kind             | request fields                                   | response fields          |
//! |------------------|--------------------------------------------------|--------------------------|
//! | create_window    | width u32 @0, height u32 @4, mode i32 @8         | window u64 @16           |
//! | destroy_window   | window u64 @0                                    |                          |
//! | create_texture   | width u32 @0, height u32 @4, need_mapping u8 @8  | texture @16, map @24     |
//! | destroy_texture  | texture u64 @0                                   |                          |
//! | create_renderer  | window u64 @0                                    | renderer u64 @8          |
//! | destroy_renderer | renderer u64 @0                                  |                          |
//! | update_texture   | texture @0, offset u64 @8, len u64 @16, data @24 |                          |
//! | copy_texture     | texture u64 @0, renderer u64 @8                  |                          |
//! | display, clear   | renderer u64 @0                                  |                          |
//! | get_display_info |                                                  | width @0, height @4      |
//!
//! INVARIANTS: Decoding never panics on arbitrary page contents

use axon_abi::PAGE_SIZE;

use crate::{RendererHandle, TextureHandle, VideoError, WindowHandle, WindowMode};

/// Bytes in front of the pixel data of an `update_texture` page.
pub const UPDATE_HEADER: usize = 3 * 8;
/// Largest pixel chunk a single `update_texture` request carries.
pub const UPDATE_CHUNK: usize = PAGE_SIZE - UPDATE_HEADER;

/// The shared request page.
#[repr(C, align(4096))]
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    bytes: [u8; PAGE_SIZE],
}

const _: () = assert!(core::mem::size_of::<Page>() == PAGE_SIZE);

impl Page {
    /// A zeroed page.
    pub const fn new() -> Self {
        Self { bytes: [0; PAGE_SIZE] }
    }

    /// Raw page contents.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    /// Mutable raw page contents.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.bytes
    }

    /// Virtual address of the page, as passed to `ipc_try_send`.
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    fn u64_at(&self, offset: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(word)
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:02x?}..)", &self.bytes[..32])
    }
}

/// Request kinds, carried as the IPC value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum RequestKind {
    CreateWindow = 1,
    DestroyWindow = 2,
    CreateTexture = 3,
    DestroyTexture = 4,
    CreateRenderer = 5,
    DestroyRenderer = 6,
    UpdateTexture = 7,
    CopyTexture = 8,
    Display = 9,
    GetDisplayInfo = 10,
    Clear = 11,
}

impl RequestKind {
    /// Decodes an IPC value.
    pub fn from_raw(raw: usize) -> Option<Self> {
        use RequestKind::*;
        Some(match raw {
            1 => CreateWindow,
            2 => DestroyWindow,
            3 => CreateTexture,
            4 => DestroyTexture,
            5 => CreateRenderer,
            6 => DestroyRenderer,
            7 => UpdateTexture,
            8 => CopyTexture,
            9 => Display,
            10 => GetDisplayInfo,
            11 => Clear,
            _ => return None,
        })
    }

    /// IPC value for this kind.
    pub fn raw(self) -> usize {
        self as usize
    }
}

/// A decoded request. `UpdateTexture` borrows its pixel bytes from the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Request<'a> {
    CreateWindow { width: u32, height: u32, mode: WindowMode },
    DestroyWindow { window: WindowHandle },
    CreateTexture { width: u32, height: u32, need_mapping: bool },
    DestroyTexture { texture: TextureHandle },
    CreateRenderer { window: WindowHandle },
    DestroyRenderer { renderer: RendererHandle },
    UpdateTexture { texture: TextureHandle, offset: u64, data: &'a [u8] },
    CopyTexture { texture: TextureHandle, renderer: RendererHandle },
    Display { renderer: RendererHandle },
    GetDisplayInfo,
    Clear { renderer: RendererHandle },
}

fn handle<H>(raw: u64, from_raw: fn(u64) -> Option<H>) -> Result<H, VideoError> {
    from_raw(raw).ok_or(VideoError::InvalidRequest)
}

impl<'a> Request<'a> {
    /// Kind carried next to this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::CreateWindow { .. } => RequestKind::CreateWindow,
            Self::DestroyWindow { .. } => RequestKind::DestroyWindow,
            Self::CreateTexture { .. } => RequestKind::CreateTexture,
            Self::DestroyTexture { .. } => RequestKind::DestroyTexture,
            Self::CreateRenderer { .. } => RequestKind::CreateRenderer,
            Self::DestroyRenderer { .. } => RequestKind::DestroyRenderer,
            Self::UpdateTexture { .. } => RequestKind::UpdateTexture,
            Self::CopyTexture { .. } => RequestKind::CopyTexture,
            Self::Display { .. } => RequestKind::Display,
            Self::GetDisplayInfo => RequestKind::GetDisplayInfo,
            Self::Clear { .. } => RequestKind::Clear,
        }
    }

    /// Writes the request fields into `page`.
    pub fn encode(&self, page: &mut Page) -> Result<(), VideoError> {
        match *self {
            Self::CreateWindow { width, height, mode } => {
                page.put_u32(0, width);
                page.put_u32(4, height);
                page.put_u32(8, mode as i32 as u32);
            }
            Self::CreateTexture { width, height, need_mapping } => {
                page.put_u32(0, width);
                page.put_u32(4, height);
                page.bytes[8] = u8::from(need_mapping);
            }
            Self::DestroyWindow { window } | Self::CreateRenderer { window } => {
                page.put_u64(0, window.raw());
            }
            Self::DestroyTexture { texture } => page.put_u64(0, texture.raw()),
            Self::DestroyRenderer { renderer } | Self::Display { renderer } | Self::Clear { renderer } => {
                page.put_u64(0, renderer.raw());
            }
            Self::UpdateTexture { texture, offset, data } => {
                if data.len() > UPDATE_CHUNK {
                    return Err(VideoError::TextureUpdate);
                }
                page.put_u64(0, texture.raw());
                page.put_u64(8, offset);
                page.put_u64(16, data.len() as u64);
                page.bytes[UPDATE_HEADER..UPDATE_HEADER + data.len()].copy_from_slice(data);
            }
            Self::CopyTexture { texture, renderer } => {
                page.put_u64(0, texture.raw());
                page.put_u64(8, renderer.raw());
            }
            Self::GetDisplayInfo => {}
        }
        Ok(())
    }

    /// Reads a request of `kind` from `page`.
    pub fn decode(kind: RequestKind, page: &'a Page) -> Result<Self, VideoError> {
        Ok(match kind {
            RequestKind::CreateWindow => Self::CreateWindow {
                width: page.u32_at(0),
                height: page.u32_at(4),
                mode: WindowMode::from_raw(page.u32_at(8) as i32).ok_or(VideoError::WindowCreate)?,
            },
            RequestKind::DestroyWindow => {
                Self::DestroyWindow { window: handle(page.u64_at(0), WindowHandle::from_raw)? }
            }
            RequestKind::CreateTexture => Self::CreateTexture {
                width: page.u32_at(0),
                height: page.u32_at(4),
                need_mapping: page.bytes[8] != 0,
            },
            RequestKind::DestroyTexture => {
                Self::DestroyTexture { texture: handle(page.u64_at(0), TextureHandle::from_raw)? }
            }
            RequestKind::CreateRenderer => {
                Self::CreateRenderer { window: handle(page.u64_at(0), WindowHandle::from_raw)? }
            }
            RequestKind::DestroyRenderer => {
                Self::DestroyRenderer { renderer: handle(page.u64_at(0), RendererHandle::from_raw)? }
            }
            RequestKind::UpdateTexture => {
                let len = usize::try_from(page.u64_at(16)).map_err(|_| VideoError::TextureUpdate)?;
                if len > UPDATE_CHUNK {
                    return Err(VideoError::TextureUpdate);
                }
                Self::UpdateTexture {
                    texture: handle(page.u64_at(0), TextureHandle::from_raw)?,
                    offset: page.u64_at(8),
                    data: &page.bytes[UPDATE_HEADER..UPDATE_HEADER + len],
                }
            }
            RequestKind::CopyTexture => Self::CopyTexture {
                texture: handle(page.u64_at(0), TextureHandle::from_raw)?,
                renderer: handle(page.u64_at(8), RendererHandle::from_raw)?,
            },
            RequestKind::Display => {
                Self::Display { renderer: handle(page.u64_at(0), RendererHandle::from_raw)? }
            }
            RequestKind::GetDisplayInfo => Self::GetDisplayInfo,
            RequestKind::Clear => Self::Clear { renderer: handle(page.u64_at(0), RendererHandle::from_raw)? },
        })
    }
}

/// Fields the server writes back into the page on success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Response {
    Window(WindowHandle),
    Texture { texture: TextureHandle, map: Option<u64> },
    Renderer(RendererHandle),
    DisplayInfo { width: u32, height: u32 },
    /// The request has no response fields.
    Done,
}

impl Response {
    /// Writes the response fields into `page`, leaving the request fields intact.
    pub fn encode(&self, page: &mut Page) {
        match *self {
            Self::Window(window) => page.put_u64(16, window.raw()),
            Self::Texture { texture, map } => {
                page.put_u64(16, texture.raw());
                page.put_u64(24, map.unwrap_or(0));
            }
            Self::Renderer(renderer) => page.put_u64(8, renderer.raw()),
            Self::DisplayInfo { width, height } => {
                page.put_u32(0, width);
                page.put_u32(4, height);
            }
            Self::Done => {}
        }
    }

    /// Reads the response to a successful request of `kind`.
    pub fn decode(kind: RequestKind, page: &Page) -> Result<Self, VideoError> {
        Ok(match kind {
            RequestKind::CreateWindow => Self::Window(handle(page.u64_at(16), WindowHandle::from_raw)?),
            RequestKind::CreateTexture => Self::Texture {
                texture: handle(page.u64_at(16), TextureHandle::from_raw)?,
                map: Some(page.u64_at(24)).filter(|addr| *addr != 0),
            },
            RequestKind::CreateRenderer => {
                Self::Renderer(handle(page.u64_at(8), RendererHandle::from_raw)?)
            }
            RequestKind::GetDisplayInfo => {
                Self::DisplayInfo { width: page.u32_at(0), height: page.u32_at(4) }
            }
            _ => Self::Done,
        })
    }
}
