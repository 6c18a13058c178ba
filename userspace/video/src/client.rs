// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Client side of the video service
//! INVARIANTS:
//!   - One request in flight; the page is reused for every call
//!   - Texture uploads never exceed UPDATE_CHUNK bytes per request

use alloc::boxed::Box;

use axon_abi::sys::{Sys, Trap};
use axon_abi::{EnvId, Errno, Prot, PAGE_SIZE};

use crate::wire::{Page, Request, RequestKind, Response, UPDATE_CHUNK};
use crate::{RendererHandle, TextureHandle, VideoError, WindowHandle, WindowMode};

/// Delivers one request page to the server and returns its status word.
pub trait Transport {
    /// Sends `page` tagged with `kind` and waits for the reply status.
    fn exchange(&mut self, kind: RequestKind, page: &mut Page) -> Result<i32, VideoError>;
}

/// Transport over axon IPC: the page is shared read-write with the server for each call.
pub struct IpcTransport<T: Trap> {
    sys: Sys<T>,
    server: EnvId,
}

impl<T: Trap> IpcTransport<T> {
    /// Talks to the video server environment `server`.
    pub fn new(sys: Sys<T>, server: EnvId) -> Self {
        Self { sys, server }
    }

    /// Server environment this transport targets.
    pub fn server(&self) -> EnvId {
        self.server
    }
}

impl<T: Trap> Transport for IpcTransport<T> {
    fn exchange(&mut self, kind: RequestKind, page: &mut Page) -> Result<i32, VideoError> {
        loop {
            match self.sys.ipc_try_send(self.server, kind.raw(), page.address(), PAGE_SIZE, Prot::RW) {
                Ok(()) => break,
                Err(Errno::NotReceiving) => self.sys.yield_(),
                Err(err) => return Err(VideoError::Ipc(err)),
            }
        }
        // Value-only receive: the response fields are already in the shared page.
        let word = self.sys.ipc_recv(usize::MAX, 0);
        Ok(word as isize as i32)
    }
}

/// Typed client for the video service.
pub struct VideoClient<T: Transport> {
    transport: T,
    page: Box<Page>,
}

impl<T: Transport> VideoClient<T> {
    /// Wraps a transport.
    pub fn new(transport: T) -> Self {
        Self { transport, page: Box::new(Page::new()) }
    }

    /// Returns the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn call(&mut self, request: Request<'_>) -> Result<Response, VideoError> {
        let kind = request.kind();
        request.encode(&mut self.page)?;
        let status = self.transport.exchange(kind, &mut self.page)?;
        VideoError::from_status(status)?;
        Response::decode(kind, &self.page)
    }

    /// Creates a window of `width` x `height` pixels.
    pub fn create_window(&mut self, width: u32, height: u32, mode: WindowMode) -> Result<WindowHandle, VideoError> {
        match self.call(Request::CreateWindow { width, height, mode })? {
            Response::Window(window) => Ok(window),
            _ => Err(VideoError::WindowCreate),
        }
    }

    /// Destroys a window.
    pub fn destroy_window(&mut self, window: WindowHandle) -> Result<(), VideoError> {
        self.call(Request::DestroyWindow { window }).map(drop)
    }

    /// Creates a texture. With `need_mapping` the server shares its storage.
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        need_mapping: bool,
    ) -> Result<(TextureHandle, Option<u64>), VideoError> {
        match self.call(Request::CreateTexture { width, height, need_mapping })? {
            Response::Texture { texture, map } => Ok((texture, map)),
            _ => Err(VideoError::TextureCreate),
        }
    }

    /// Destroys a texture.
    pub fn destroy_texture(&mut self, texture: TextureHandle) -> Result<(), VideoError> {
        self.call(Request::DestroyTexture { texture }).map(drop)
    }

    /// Creates a renderer bound to `window`.
    pub fn create_renderer(&mut self, window: WindowHandle) -> Result<RendererHandle, VideoError> {
        match self.call(Request::CreateRenderer { window })? {
            Response::Renderer(renderer) => Ok(renderer),
            _ => Err(VideoError::RendererCreate),
        }
    }

    /// Destroys a renderer.
    pub fn destroy_renderer(&mut self, renderer: RendererHandle) -> Result<(), VideoError> {
        self.call(Request::DestroyRenderer { renderer }).map(drop)
    }

    /// Uploads `pixels` into `texture`, one page-sized chunk per request.
    pub fn update_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> Result<(), VideoError> {
        for (index, chunk) in pixels.chunks(UPDATE_CHUNK).enumerate() {
            let offset = (index * UPDATE_CHUNK) as u64;
            self.call(Request::UpdateTexture { texture, offset, data: chunk }).map_err(|err| match err {
                VideoError::Ipc(_) => err,
                _ => VideoError::TextureUpdate,
            })?;
        }
        Ok(())
    }

    /// Copies `texture` into the renderer's back buffer.
    pub fn copy_texture(&mut self, texture: TextureHandle, renderer: RendererHandle) -> Result<(), VideoError> {
        self.call(Request::CopyTexture { texture, renderer }).map(drop)
    }

    /// Presents the renderer's back buffer.
    pub fn display(&mut self, renderer: RendererHandle) -> Result<(), VideoError> {
        self.call(Request::Display { renderer }).map(drop)
    }

    /// Display size in pixels.
    pub fn display_info(&mut self) -> Result<(u32, u32), VideoError> {
        match self.call(Request::GetDisplayInfo)? {
            Response::DisplayInfo { width, height } => Ok((width, height)),
            _ => Err(VideoError::InvalidRequest),
        }
    }

    /// Clears the renderer's back buffer to black.
    pub fn clear(&mut self, renderer: RendererHandle) -> Result<(), VideoError> {
        self.call(Request::Clear { renderer }).map(drop)
    }
}
