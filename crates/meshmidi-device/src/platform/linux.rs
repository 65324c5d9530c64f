/// Linux ALSA sequencer backend. Opens a node-owned sequencer client and
/// connects one port per hardware MIDI port it is asked to open, converting
/// between raw MIDI bytes and ALSA sequencer events at the boundary — the
/// same conversion the reference virtual-device backend uses, but here
/// talking to existing hardware ports instead of creating a cloned virtual
/// one.
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use alsa::seq::{self, Addr, Event, EventType, PortCap, PortInfo, PortType, Seq};
use meshmidi_protocol::routing::DeviceDirection;
use tracing::{debug, warn};

use crate::{DeviceError, MidiPort, PortDescriptor};

impl From<alsa::Error> for DeviceError {
    fn from(e: alsa::Error) -> Self {
        DeviceError::Backend(e.to_string())
    }
}

pub fn enumerate() -> Result<Vec<PortDescriptor>, DeviceError> {
    let seq_handle = Seq::open(None, None, false)?;
    let mut ports = Vec::new();

    let client_iter = seq::ClientIter::new(&seq_handle);
    for client in client_iter {
        let client_id = client.get_client();
        let port_iter = seq::PortIter::new(&seq_handle, client_id);
        for port in port_iter {
            let caps = port.get_capability();
            let is_input = caps.contains(PortCap::SUBS_READ);
            let is_output = caps.contains(PortCap::SUBS_WRITE);
            if !is_input && !is_output {
                continue;
            }
            // Pack (client, port) into a single u16 id: 8 bits each. ALSA
            // client/port numbers fit comfortably within a byte in practice.
            let id = ((client_id as u16) << 8) | (port.get_port() as u16 & 0xFF);
            let name = port.get_name().unwrap_or("unnamed").to_string();
            ports.push(PortDescriptor {
                id,
                name,
                direction: if is_input {
                    DeviceDirection::Input
                } else {
                    DeviceDirection::Output
                },
            });
        }
    }
    Ok(ports)
}

fn unpack_id(id: u16) -> (i32, i32) {
    ((id >> 8) as i32, (id & 0xFF) as i32)
}

pub fn open(id: u16) -> Result<Box<dyn MidiPort>, DeviceError> {
    let (target_client, target_port) = unpack_id(id);

    let seq_handle = Seq::open(None, None, true)?;
    let client_name = CString::new(format!("meshmidi-{}", id)).unwrap();
    seq_handle.set_client_name(&client_name)?;

    let mut our_info = PortInfo::empty()?;
    our_info.set_name(&CString::new("meshmidi").unwrap());
    our_info.set_capability(PortCap::READ | PortCap::WRITE | PortCap::SUBS_READ | PortCap::SUBS_WRITE);
    our_info.set_type(PortType::MIDI_GENERIC | PortType::APPLICATION);
    seq_handle.create_port(&our_info)?;
    let our_port = our_info.get_port();
    let our_client = seq_handle.client_id()?;

    let sub = seq::PortSubscribe::empty()?;
    sub.set_sender(Addr {
        client: target_client,
        port: target_port,
    });
    sub.set_dest(Addr {
        client: our_client,
        port: our_port,
    });
    // Best-effort: a port that only supports one direction will just not
    // deliver events the other way.
    let _ = seq_handle.subscribe_port(&sub);

    let descriptor = enumerate()?
        .into_iter()
        .find(|p| p.id == id)
        .ok_or(DeviceError::NotFound(id))?;

    let recv_buffer = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let running = Arc::new(AtomicBool::new(true));

    if descriptor.direction == DeviceDirection::Input {
        let buf = Arc::clone(&recv_buffer);
        let run_flag = Arc::clone(&running);
        let rx_seq = Seq::open(None, Some(alsa::Direction::Capture), false)?;
        std::thread::Builder::new()
            .name(format!("meshmidi-alsa-rx-{}", id))
            .spawn(move || run_receiver(rx_seq, run_flag, buf))
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
    }

    Ok(Box::new(AlsaMidiPort {
        id,
        name: descriptor.name,
        direction: descriptor.direction,
        seq_handle,
        port: our_port,
        recv_buffer,
        running,
    }))
}

fn run_receiver(seq_rx: Seq, running: Arc<AtomicBool>, buf: Arc<Mutex<Vec<Vec<u8>>>>) {
    use alsa::PollDescriptors;
    let fds: Result<Vec<libc::pollfd>, _> = (&seq_rx, Some(alsa::Direction::Capture)).get();
    let mut fds = match fds {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to get ALSA poll descriptors: {}", e);
            return;
        }
    };

    while running.load(Ordering::SeqCst) {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 100) };
        if ret <= 0 {
            continue;
        }
        let mut input = seq_rx.input();
        while matches!(input.event_input_pending(true), Ok(n) if n > 0) {
            if let Ok(event) = input.event_input() {
                if let Some(bytes) = alsa_event_to_raw_midi(&event) {
                    if let Ok(mut b) = buf.lock() {
                        if b.len() >= 4096 {
                            b.remove(0);
                        }
                        b.push(bytes);
                    }
                }
            }
        }
    }
}

struct AlsaMidiPort {
    id: u16,
    name: String,
    direction: DeviceDirection,
    seq_handle: Seq,
    port: i32,
    recv_buffer: Arc<Mutex<Vec<Vec<u8>>>>,
    running: Arc<AtomicBool>,
}

impl MidiPort for AlsaMidiPort {
    fn id(&self) -> u16 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> DeviceDirection {
        self.direction
    }

    fn send(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut offset = 0;
        while offset < data.len() {
            let (event_opt, consumed) = raw_midi_to_alsa_event(&data[offset..]);
            if consumed == 0 {
                offset += 1;
                continue;
            }
            if let Some(mut ev) = event_opt {
                ev.set_source(self.port);
                ev.set_subs();
                ev.set_direct();
                self.seq_handle.event_output(&mut ev)?;
            }
            offset += consumed;
        }
        self.seq_handle.drain_output()?;
        Ok(())
    }

    fn poll_receive(&self) -> Result<Option<Vec<u8>>, DeviceError> {
        let mut buf = self
            .recv_buffer
            .lock()
            .map_err(|_| DeviceError::Backend("recv buffer poisoned".to_string()))?;
        Ok(if buf.is_empty() {
            None
        } else {
            Some(buf.remove(0))
        })
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.running.store(false, Ordering::SeqCst);
        debug!(id = self.id, "closed ALSA MIDI port");
        Ok(())
    }
}

fn raw_midi_to_alsa_event(data: &[u8]) -> (Option<Event>, usize) {
    if data.is_empty() {
        return (None, 0);
    }
    let status = data[0];

    if status == 0xF0 {
        let end = data.iter().position(|&b| b == 0xF7);
        let len = end.map(|p| p + 1).unwrap_or(data.len());
        let ev = Event::new_ext(EventType::Sysex, &data[..len]);
        return (Some(ev), len);
    }

    if status >= 0xF8 {
        let ev_type = match status {
            0xF8 => Some(EventType::Clock),
            0xFA => Some(EventType::Start),
            0xFB => Some(EventType::Continue),
            0xFC => Some(EventType::Stop),
            0xFE => Some(EventType::Sensing),
            0xFF => Some(EventType::Reset),
            _ => None,
        };
        let ctrl = seq::EvCtrl {
            channel: 0,
            param: 0,
            value: 0,
        };
        return (ev_type.map(|t| Event::new(t, &ctrl)), 1);
    }

    if data.len() < 3 && (status & 0xF0) != 0xC0 && (status & 0xF0) != 0xD0 {
        return (None, data.len().max(1));
    }

    let channel = status & 0x0F;
    let msg_type = status & 0xF0;
    let ctrl = seq::EvCtrl {
        channel: channel as u8,
        param: *data.get(1).unwrap_or(&0) as u32,
        value: *data.get(2).unwrap_or(&0) as i32,
    };

    let (ev_type, consumed) = match msg_type {
        0x80 => (EventType::Noteoff, 3),
        0x90 => (EventType::Noteon, 3),
        0xA0 => (EventType::Keypress, 3),
        0xB0 => (EventType::Controller, 3),
        0xC0 => (EventType::Pgmchange, 2),
        0xD0 => (EventType::Chanpress, 2),
        0xE0 => (EventType::Pitchbend, 3),
        _ => return (None, 1),
    };
    (Some(Event::new(ev_type, &ctrl)), consumed)
}

fn alsa_event_to_raw_midi(event: &Event) -> Option<Vec<u8>> {
    match event.get_type() {
        EventType::Noteon => {
            let d: seq::EvNote = event.get_data()?;
            Some(vec![0x90 | d.channel, d.note, d.velocity])
        }
        EventType::Noteoff => {
            let d: seq::EvNote = event.get_data()?;
            Some(vec![0x80 | d.channel, d.note, d.velocity])
        }
        EventType::Controller => {
            let d: seq::EvCtrl = event.get_data()?;
            Some(vec![0xB0 | d.channel, d.param as u8, d.value as u8])
        }
        EventType::Pgmchange => {
            let d: seq::EvCtrl = event.get_data()?;
            Some(vec![0xC0 | d.channel, d.value as u8])
        }
        EventType::Pitchbend => {
            let d: seq::EvCtrl = event.get_data()?;
            let value = (d.value + 8192) as u16;
            Some(vec![0xE0 | d.channel, (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8])
        }
        EventType::Sysex => event.get_ext().map(|bytes| bytes.to_vec()),
        _ => None,
    }
}
