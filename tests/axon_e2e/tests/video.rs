// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Video protocol over real kernel IPC: a driver environment owns the framebuffer window
//! and serves one-page requests; a user environment talks to it through `VideoClient`.

use axon::abi::{EnvId, EnvType, Errno, Sysno};
use axon::config::DeviceWindow;
use axon::types::PhysAddr;
use axon::KernelConfig;
use axon_e2e::{errno, Machine, Prot, PAGE_SIZE};
use axon_video::{
    Page, RequestKind, Transport, VecFramebuffer, VideoClient, VideoError, VideoServer, WindowMode, UPDATE_CHUNK,
};

const FB: u64 = 0xfd00_0000;
const FB_W: u32 = 32;
const FB_H: u32 = 16;
const FB_VA: usize = 0x1000_0000;
/// Client page handed to the server on every request.
const CLIENT_PAGE: usize = 0x20_0000;
/// Where the server receives request pages.
const SERVER_PAGE: usize = 0x30_0000;

/// Server environment driven by the harness: it listens, serves, replies, listens again.
struct Driver {
    id: EnvId,
    video: VideoServer<VecFramebuffer>,
    listening: bool,
    served: usize,
}

impl Driver {
    fn step(&mut self, m: &mut Machine) {
        assert_eq!(m.running(), Some(self.id));
        if self.listening {
            let kind = m.result(self.id);
            let inbox = m.kernel().inbox(self.id).unwrap();
            let client = inbox.sender().unwrap();
            let mut page = Page::new();
            page.as_bytes_mut().copy_from_slice(&m.read(self.id, SERVER_PAGE, PAGE_SIZE).unwrap());
            let status = self.video.handle(kind, &mut page);
            m.write(self.id, SERVER_PAGE, page.as_bytes()).unwrap();
            self.flush(m);
            self.served += 1;
            let reply = [client.raw(), status as isize as usize, m.ceiling(), 0, 0, 0];
            let sent = m.trap(self.id, Sysno::IpcTrySend, reply);
            assert_eq!(errno(sent), Ok(0));
        }
        m.trap(self.id, Sysno::IpcRecv, [SERVER_PAGE, PAGE_SIZE, 0, 0, 0, 0]);
        self.listening = true;
    }

    /// Copies the server's framebuffer into the device window through the driver's mapping.
    fn flush(&self, m: &mut Machine) {
        let bytes: Vec<u8> = self.video.framebuffer().pixels().iter().flat_map(|p| p.to_le_bytes()).collect();
        m.write(self.id, FB_VA, &bytes).unwrap();
    }
}

/// Client side: the harness copies the request page into the client environment and
/// runs whoever the kernel schedules until the client is back on the CPU.
struct MachineTransport {
    machine: Machine,
    client: EnvId,
    driver: Driver,
}

impl MachineTransport {
    fn run_until_client(&mut self) {
        for _ in 0..16 {
            if self.machine.running() == Some(self.client) {
                return;
            }
            self.driver.step(&mut self.machine);
        }
        panic!("client never resumed");
    }
}

impl Transport for MachineTransport {
    fn exchange(&mut self, kind: RequestKind, page: &mut Page) -> Result<i32, VideoError> {
        let (client, server) = (self.client, self.driver.id);
        self.machine.write(client, CLIENT_PAGE, page.as_bytes()).unwrap();
        let send = [server.raw(), kind.raw(), CLIENT_PAGE, PAGE_SIZE, Prot::RW.bits() as usize, 0];
        loop {
            match errno(self.machine.trap(client, Sysno::IpcTrySend, send)) {
                Ok(_) => break,
                Err(Errno::NotReceiving) => {
                    self.machine.trap(client, Sysno::Yield, [0; 6]);
                    self.run_until_client();
                }
                Err(err) => return Err(VideoError::Ipc(err)),
            }
        }
        let ceiling = self.machine.ceiling();
        self.machine.trap(client, Sysno::IpcRecv, [ceiling, 0, 0, 0, 0, 0]);
        self.run_until_client();
        let status = self.machine.result(client) as isize as i32;
        page.as_bytes_mut().copy_from_slice(&self.machine.read(client, CLIENT_PAGE, PAGE_SIZE).unwrap());
        Ok(status)
    }
}

fn setup() -> VideoClient<MachineTransport> {
    let fb_len = (FB_W * FB_H * 4) as u64;
    let mut m = Machine::new(KernelConfig {
        max_envs: 8,
        ram_frames: 64,
        devices: vec![DeviceWindow { base: FB, len: fb_len.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64 }],
        ..KernelConfig::default()
    });
    let vga = m.boot(EnvType::VideoDriver);
    let client = m.boot(EnvType::User);
    m.sys(vga).map_physical_region(FB as usize, None, FB_VA, PAGE_SIZE, Prot::RW).unwrap();

    let mut driver = Driver { id: vga, video: VideoServer::new(VecFramebuffer::new(FB_W, FB_H)), listening: false, served: 0 };
    driver.step(&mut m);
    assert_eq!(m.running(), Some(client));
    m.sys(client).alloc_region(None, CLIENT_PAGE, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    VideoClient::new(MachineTransport { machine: m, client, driver })
}

fn device_pixel(m: &Machine, x: u32, y: u32) -> u32 {
    let at = ((y * FB_W + x) * 4) as usize;
    let page = m.kernel().mem().device_bytes(PhysAddr::new(FB)).unwrap();
    u32::from_le_bytes(page[at..at + 4].try_into().unwrap())
}

#[test]
fn texture_reaches_the_device_through_ipc() {
    let mut video = setup();
    assert_eq!(video.display_info(), Ok((FB_W, FB_H)));

    let window = video.create_window(4, 2, WindowMode::Centered).unwrap();
    let renderer = video.create_renderer(window).unwrap();
    let (texture, _) = video.create_texture(4, 2, false).unwrap();
    let pixels: Vec<u8> = (1u32..=8).flat_map(|p| (p * 0x0101_0101).to_le_bytes()).collect();
    video.update_texture(texture, &pixels).unwrap();
    video.copy_texture(texture, renderer).unwrap();
    video.display(renderer).unwrap();

    let t = video.transport_mut();
    assert_eq!(t.driver.served, 7);
    let (ox, oy) = ((FB_W - 4) / 2, (FB_H - 2) / 2);
    assert_eq!(device_pixel(&t.machine, ox, oy), 0x0101_0101);
    assert_eq!(device_pixel(&t.machine, ox + 3, oy + 1), 8 * 0x0101_0101);
    assert_eq!(device_pixel(&t.machine, 0, 0), 0);
    // The request page is shared with the server, not copied.
    assert_eq!(t.machine.refs(t.client, CLIENT_PAGE), 2);
}

#[test]
fn large_uploads_are_chunked() {
    let mut video = setup();
    let (texture, _) = video.create_texture(64, 32, false).unwrap();
    let pixels: Vec<u8> = (0..64 * 32 * 4).map(|i: u32| (i % 251) as u8).collect();
    video.update_texture(texture, &pixels).unwrap();
    let t = video.transport_mut();
    assert_eq!(t.driver.served, 1 + pixels.len().div_ceil(UPDATE_CHUNK));
    assert_eq!(t.driver.video.texture_bytes(texture), Some(&pixels[..]));
}

#[test]
fn server_errors_come_back_as_status_words() {
    let mut video = setup();
    assert_eq!(video.create_window(FB_W + 1, 1, WindowMode::Corner), Err(VideoError::WindowCreate));
    assert_eq!(video.create_texture(1, 1, true), Err(VideoError::TextureCreate));
    let (texture, _) = video.create_texture(1, 1, false).unwrap();
    assert_eq!(video.update_texture(texture, &[0u8; 8]), Err(VideoError::TextureUpdate));
}
