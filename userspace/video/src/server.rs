// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reference video server rendering into a linear 32-bit framebuffer
//! INVARIANTS:
//!   - Handles are slot index + 1 and are never reused while the slot is live
//!   - Drawing is clipped to the display; no request can write outside it

use alloc::vec;
use alloc::vec::Vec;

use crate::wire::{Page, Request, RequestKind, Response};
use crate::{RendererHandle, TextureHandle, VideoError, WindowHandle, WindowMode};

/// Pixel sink the server presents into.
pub trait Framebuffer {
    /// Display width in pixels.
    fn width(&self) -> u32;
    /// Display height in pixels.
    fn height(&self) -> u32;
    /// Stores one pixel; callers stay inside the display.
    fn set_pixel(&mut self, x: u32, y: u32, pixel: u32);

    /// Fills the whole display with `pixel`.
    fn fill(&mut self, pixel: u32) {
        for y in 0..self.height() {
            for x in 0..self.width() {
                self.set_pixel(x, y, pixel);
            }
        }
    }
}

/// Heap-backed framebuffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VecFramebuffer {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl VecFramebuffer {
    /// A black display of `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, pixels: vec![0; width as usize * height as usize] }
    }

    /// Pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// All pixels, row-major.
    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }
}

impl Framebuffer for VecFramebuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn set_pixel(&mut self, x: u32, y: u32, pixel: u32) {
        let index = y as usize * self.width as usize + x as usize;
        self.pixels[index] = pixel;
    }

    fn fill(&mut self, pixel: u32) {
        self.pixels.fill(pixel);
    }
}

#[derive(Debug)]
struct Window {
    width: u32,
    height: u32,
    mode: WindowMode,
}

#[derive(Debug)]
struct Texture {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

impl Texture {
    fn pixel(&self, x: u32, y: u32) -> u32 {
        let at = (y as usize * self.width as usize + x as usize) * 4;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[at..at + 4]);
        u32::from_le_bytes(word)
    }
}

#[derive(Debug)]
struct Renderer {
    window: WindowHandle,
    back: Vec<u32>,
}

struct Slab<T> {
    slots: Vec<Option<T>>,
}

impl<T> Slab<T> {
    const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn insert(&mut self, value: T) -> u64 {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        index as u64 + 1
    }

    fn get(&self, handle: u64) -> Option<&T> {
        self.slots.get(handle.checked_sub(1)? as usize)?.as_ref()
    }

    fn get_mut(&mut self, handle: u64) -> Option<&mut T> {
        self.slots.get_mut(handle.checked_sub(1)? as usize)?.as_mut()
    }

    fn remove(&mut self, handle: u64) -> Option<T> {
        self.slots.get_mut(handle.checked_sub(1)? as usize)?.take()
    }
}

/// Serves video requests against a framebuffer.
pub struct VideoServer<F: Framebuffer> {
    fb: F,
    windows: Slab<Window>,
    textures: Slab<Texture>,
    renderers: Slab<Renderer>,
}

impl<F: Framebuffer> VideoServer<F> {
    /// A server with no objects.
    pub fn new(fb: F) -> Self {
        Self { fb, windows: Slab::new(), textures: Slab::new(), renderers: Slab::new() }
    }

    /// The display.
    pub fn framebuffer(&self) -> &F {
        &self.fb
    }

    /// Stored bytes of `texture`.
    pub fn texture_bytes(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(texture.raw()).map(|tex| tex.bytes.as_slice())
    }

    /// Serves the request of kind `kind` in `page` and returns the reply status word.
    /// On success the response fields are written back into `page`.
    pub fn handle(&mut self, kind: usize, page: &mut Page) -> i32 {
        let result = RequestKind::from_raw(kind)
            .ok_or(VideoError::InvalidRequest)
            .and_then(|kind| Request::decode(kind, page))
            .and_then(|request| self.serve(request));
        match result {
            Ok(response) => {
                response.encode(page);
                0
            }
            Err(err) => {
                log::debug!(target: "video", "request {kind} failed: {err}");
                err.status()
            }
        }
    }

    /// Executes one decoded request.
    pub fn serve(&mut self, request: Request<'_>) -> Result<Response, VideoError> {
        match request {
            Request::CreateWindow { width, height, mode } => self.create_window(width, height, mode),
            Request::DestroyWindow { window } => {
                self.windows.remove(window.raw()).ok_or(VideoError::InvalidRequest)?;
                Ok(Response::Done)
            }
            Request::CreateTexture { width, height, need_mapping } => {
                // Shared texture storage would need a page grant back to the client.
                if need_mapping || width == 0 || height == 0 {
                    return Err(VideoError::TextureCreate);
                }
                let len = (width as usize)
                    .checked_mul(height as usize)
                    .and_then(|px| px.checked_mul(4))
                    .ok_or(VideoError::TextureCreate)?;
                let raw = self.textures.insert(Texture { width, height, bytes: vec![0; len] });
                let texture = TextureHandle::from_raw(raw).ok_or(VideoError::TextureCreate)?;
                Ok(Response::Texture { texture, map: None })
            }
            Request::DestroyTexture { texture } => {
                self.textures.remove(texture.raw()).ok_or(VideoError::InvalidRequest)?;
                Ok(Response::Done)
            }
            Request::CreateRenderer { window } => {
                let win = self.windows.get(window.raw()).ok_or(VideoError::RendererCreate)?;
                let back = vec![0; win.width as usize * win.height as usize];
                let raw = self.renderers.insert(Renderer { window, back });
                RendererHandle::from_raw(raw).map(Response::Renderer).ok_or(VideoError::RendererCreate)
            }
            Request::DestroyRenderer { renderer } => {
                self.renderers.remove(renderer.raw()).ok_or(VideoError::InvalidRequest)?;
                Ok(Response::Done)
            }
            Request::UpdateTexture { texture, offset, data } => {
                let tex = self.textures.get_mut(texture.raw()).ok_or(VideoError::TextureUpdate)?;
                let start = usize::try_from(offset).map_err(|_| VideoError::TextureUpdate)?;
                let end = start.checked_add(data.len()).ok_or(VideoError::TextureUpdate)?;
                tex.bytes.get_mut(start..end).ok_or(VideoError::TextureUpdate)?.copy_from_slice(data);
                Ok(Response::Done)
            }
            Request::CopyTexture { texture, renderer } => {
                let tex = self.textures.get(texture.raw()).ok_or(VideoError::InvalidRequest)?;
                let rend = self.renderers.get_mut(renderer.raw()).ok_or(VideoError::InvalidRequest)?;
                let win = self.windows.get(rend.window.raw()).ok_or(VideoError::InvalidRequest)?;
                for y in 0..tex.height.min(win.height) {
                    for x in 0..tex.width.min(win.width) {
                        rend.back[y as usize * win.width as usize + x as usize] = tex.pixel(x, y);
                    }
                }
                Ok(Response::Done)
            }
            Request::Display { renderer } => {
                self.display(renderer)?;
                Ok(Response::Done)
            }
            Request::GetDisplayInfo => {
                Ok(Response::DisplayInfo { width: self.fb.width(), height: self.fb.height() })
            }
            Request::Clear { renderer } => {
                let rend = self.renderers.get_mut(renderer.raw()).ok_or(VideoError::InvalidRequest)?;
                rend.back.fill(0);
                Ok(Response::Done)
            }
        }
    }

    fn create_window(&mut self, width: u32, height: u32, mode: WindowMode) -> Result<Response, VideoError> {
        let (dw, dh) = (self.fb.width(), self.fb.height());
        let fits = match mode {
            WindowMode::Fullscreen => true,
            WindowMode::Corner | WindowMode::Centered => width <= dw && height <= dh,
            WindowMode::Scale2x => width.saturating_mul(2) <= dw && height.saturating_mul(2) <= dh,
        };
        if width == 0 || height == 0 || !fits {
            return Err(VideoError::WindowCreate);
        }
        self.fb.fill(0);
        let raw = self.windows.insert(Window { width, height, mode });
        log::debug!(target: "video", "window {raw}: {width}x{height} {mode:?}");
        WindowHandle::from_raw(raw).map(Response::Window).ok_or(VideoError::WindowCreate)
    }

    fn display(&mut self, renderer: RendererHandle) -> Result<(), VideoError> {
        let rend = self.renderers.get(renderer.raw()).ok_or(VideoError::InvalidRequest)?;
        let win = self.windows.get(rend.window.raw()).ok_or(VideoError::InvalidRequest)?;
        let (dw, dh) = (self.fb.width(), self.fb.height());
        let back = |x: u32, y: u32| rend.back[y as usize * win.width as usize + x as usize];
        match win.mode {
            WindowMode::Corner | WindowMode::Centered => {
                let (ox, oy) = match win.mode {
                    WindowMode::Centered => ((dw - win.width) / 2, (dh - win.height) / 2),
                    _ => (0, 0),
                };
                for y in 0..win.height {
                    for x in 0..win.width {
                        self.fb.set_pixel(ox + x, oy + y, back(x, y));
                    }
                }
            }
            WindowMode::Fullscreen => {
                for y in 0..dh {
                    let sy = (u64::from(y) * u64::from(win.height) / u64::from(dh)) as u32;
                    for x in 0..dw {
                        let sx = (u64::from(x) * u64::from(win.width) / u64::from(dw)) as u32;
                        self.fb.set_pixel(x, y, back(sx, sy));
                    }
                }
            }
            WindowMode::Scale2x => {
                for y in 0..win.height * 2 {
                    for x in 0..win.width * 2 {
                        self.fb.set_pixel(x, y, back(x / 2, y / 2));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Page;

    fn server(width: u32, height: u32) -> VideoServer<VecFramebuffer> {
        VideoServer::new(VecFramebuffer::new(width, height))
    }

    /// Window + renderer whose back buffer holds `pixels` (row-major, `w` wide).
    fn setup(
        srv: &mut VideoServer<VecFramebuffer>,
        w: u32,
        h: u32,
        mode: WindowMode,
        pixels: &[u32],
    ) -> RendererHandle {
        let Ok(Response::Window(window)) = srv.serve(Request::CreateWindow { width: w, height: h, mode }) else {
            panic!("window");
        };
        let Ok(Response::Renderer(renderer)) = srv.serve(Request::CreateRenderer { window }) else {
            panic!("renderer");
        };
        let Ok(Response::Texture { texture, .. }) =
            srv.serve(Request::CreateTexture { width: w, height: h, need_mapping: false })
        else {
            panic!("texture");
        };
        let bytes: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        srv.serve(Request::UpdateTexture { texture, offset: 0, data: &bytes }).unwrap();
        srv.serve(Request::CopyTexture { texture, renderer }).unwrap();
        renderer
    }

    #[test]
    fn centered_window_is_offset() {
        let mut srv = server(6, 4);
        let renderer = setup(&mut srv, 2, 2, WindowMode::Centered, &[1, 2, 3, 4]);
        srv.serve(Request::Display { renderer }).unwrap();
        let fb = srv.framebuffer();
        assert_eq!(fb.pixel(2, 1), 1);
        assert_eq!(fb.pixel(3, 1), 2);
        assert_eq!(fb.pixel(2, 2), 3);
        assert_eq!(fb.pixel(3, 2), 4);
        assert_eq!(fb.pixels().iter().filter(|p| **p != 0).count(), 4);
    }

    #[test]
    fn scale2x_doubles_each_pixel() {
        let mut srv = server(4, 4);
        let renderer = setup(&mut srv, 2, 1, WindowMode::Scale2x, &[7, 9]);
        srv.serve(Request::Display { renderer }).unwrap();
        let fb = srv.framebuffer();
        assert_eq!(&fb.pixels()[..8], &[7, 7, 9, 9, 7, 7, 9, 9]);
        assert_eq!(fb.pixel(0, 2), 0);
    }

    #[test]
    fn fullscreen_stretches_over_the_display() {
        let mut srv = server(4, 2);
        let renderer = setup(&mut srv, 2, 1, WindowMode::Fullscreen, &[5, 6]);
        srv.serve(Request::Display { renderer }).unwrap();
        assert_eq!(srv.framebuffer().pixels(), &[5, 5, 6, 6, 5, 5, 6, 6]);
    }

    #[test]
    fn window_larger_than_display_is_refused() {
        let mut srv = server(4, 4);
        assert_eq!(
            srv.serve(Request::CreateWindow { width: 5, height: 1, mode: WindowMode::Corner }),
            Err(VideoError::WindowCreate)
        );
        assert_eq!(
            srv.serve(Request::CreateWindow { width: 3, height: 1, mode: WindowMode::Scale2x }),
            Err(VideoError::WindowCreate)
        );
        assert!(srv.serve(Request::CreateWindow { width: 64, height: 64, mode: WindowMode::Fullscreen }).is_ok());
    }

    #[test]
    fn clear_blanks_the_back_buffer() {
        let mut srv = server(2, 1);
        let renderer = setup(&mut srv, 2, 1, WindowMode::Corner, &[3, 3]);
        srv.serve(Request::Clear { renderer }).unwrap();
        srv.serve(Request::Display { renderer }).unwrap();
        assert_eq!(srv.framebuffer().pixels(), &[0, 0]);
    }

    #[test]
    fn mapped_textures_are_not_offered() {
        let mut srv = server(2, 2);
        assert_eq!(
            srv.serve(Request::CreateTexture { width: 1, height: 1, need_mapping: true }),
            Err(VideoError::TextureCreate)
        );
    }

    #[test]
    fn page_handler_reports_status_words() {
        let mut srv = server(2, 2);
        let mut page = Page::new();
        assert_eq!(srv.handle(0, &mut page), VideoError::InvalidRequest.status());
        // Zeroed page: renderer handle 0.
        assert_eq!(srv.handle(RequestKind::Display.raw(), &mut page), VideoError::InvalidRequest.status());
        assert_eq!(srv.handle(RequestKind::GetDisplayInfo.raw(), &mut page), 0);
        assert_eq!(Response::decode(RequestKind::GetDisplayInfo, &page), Ok(Response::DisplayInfo { width: 2, height: 2 }));
    }

    #[test]
    fn destroyed_handles_stop_resolving() {
        let mut srv = server(2, 2);
        let renderer = setup(&mut srv, 1, 1, WindowMode::Corner, &[1]);
        srv.serve(Request::DestroyRenderer { renderer }).unwrap();
        assert_eq!(srv.serve(Request::DestroyRenderer { renderer }), Err(VideoError::InvalidRequest));
        assert_eq!(srv.serve(Request::Clear { renderer }), Err(VideoError::InvalidRequest));
    }
}
