//! External-control wire server.
//!
//! Speaks the same fixed-layout message protocol as Whisper's socket interface
//! (`original_source/WhisperMessage.h`), so an existing Whisper-compatible test bench can drive
//! this simulator as a drop-in replacement. Each message is a fixed `MESSAGE_LEN`-byte record,
//! little-endian, with no framing beyond its fixed size.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

/// `hart, kind, resource, size, flags, instr_tag, time, address, value, buffer[128], tag[20]`.
pub const MESSAGE_LEN: usize = 4 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 128 + 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    Peek = 0,
    Poke = 1,
    Step = 2,
    Until = 3,
    Change = 4,
    ChangeCount = 5,
    Quit = 6,
    Invalid = 7,
    Reset = 8,
    Exception = 9,
    EnterDebug = 10,
    ExitDebug = 11,
    LoadFinished = 12,
    CancelDiv = 13,
    CancelLr = 14,
    DumpMemory = 15,
    McmRead = 16,
    McmInsert = 17,
    McmWrite = 18,
    PageTableWalk = 19,
    Translate = 20,
    CheckInterrupt = 21,
    SeiPin = 22,
    /// Injects an asynchronous exception/interrupt directly, beyond what Whisper's own
    /// message set supports.
    InjectException = 23,
    Nmi = 24,
    ClearNmi = 25,
}

impl CommandKind {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Peek,
            1 => Self::Poke,
            2 => Self::Step,
            3 => Self::Until,
            4 => Self::Change,
            5 => Self::ChangeCount,
            6 => Self::Quit,
            8 => Self::Reset,
            9 => Self::Exception,
            10 => Self::EnterDebug,
            11 => Self::ExitDebug,
            12 => Self::LoadFinished,
            13 => Self::CancelDiv,
            14 => Self::CancelLr,
            15 => Self::DumpMemory,
            16 => Self::McmRead,
            17 => Self::McmInsert,
            18 => Self::McmWrite,
            19 => Self::PageTableWalk,
            20 => Self::Translate,
            21 => Self::CheckInterrupt,
            22 => Self::SeiPin,
            23 => Self::InjectException,
            24 => Self::Nmi,
            25 => Self::ClearNmi,
            _ => Self::Invalid,
        }
    }
}

/// Resource identifiers for the `Peek`/`Poke` `PrivMode`/... special resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialResource {
    PrivMode,
    PrevPrivMode,
    FpFlags,
    Trap,
    DeferredInterrupts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub hart: u32,
    pub kind: CommandKind,
    pub resource: u32,
    pub size: u32,
    pub flags: u32,
    pub instr_tag: u64,
    pub time: u64,
    pub address: u64,
    pub value: u64,
    pub buffer: [u8; 128],
    pub tag: [u8; 20],
}

impl Default for Message {
    fn default() -> Self {
        Self {
            hart: 0,
            kind: CommandKind::Invalid,
            resource: 0,
            size: 0,
            flags: 0,
            instr_tag: 0,
            time: 0,
            address: 0,
            value: 0,
            buffer: [0; 128],
            tag: [0; 20],
        }
    }
}

impl Message {
    pub fn reply(kind: CommandKind, address: u64, value: u64) -> Self {
        Self {
            kind,
            address,
            value,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_LEN] {
        let mut out = [0u8; MESSAGE_LEN];
        let mut offset = 0;
        macro_rules! put {
            ($value:expr) => {{
                let bytes = $value.to_le_bytes();
                out[offset..offset + bytes.len()].copy_from_slice(&bytes);
                offset += bytes.len();
            }};
        }
        put!(self.hart);
        put!(self.kind as u32);
        put!(self.resource);
        put!(self.size);
        put!(self.flags);
        put!(self.instr_tag);
        put!(self.time);
        put!(self.address);
        put!(self.value);
        out[offset..offset + self.buffer.len()].copy_from_slice(&self.buffer);
        offset += self.buffer.len();
        out[offset..offset + self.tag.len()].copy_from_slice(&self.tag);
        offset += self.tag.len();
        debug_assert_eq!(offset, MESSAGE_LEN);
        out
    }

    pub fn from_bytes(bytes: &[u8; MESSAGE_LEN]) -> Self {
        let mut offset = 0;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let value = <$ty>::from_le_bytes(bytes[offset..offset + N].try_into().unwrap());
                offset += N;
                value
            }};
        }
        let hart = take!(u32);
        let kind = CommandKind::from_u32(take!(u32));
        let resource = take!(u32);
        let size = take!(u32);
        let flags = take!(u32);
        let instr_tag = take!(u64);
        let time = take!(u64);
        let address = take!(u64);
        let value = take!(u64);
        let mut buffer = [0u8; 128];
        buffer.copy_from_slice(&bytes[offset..offset + 128]);
        offset += 128;
        let mut tag = [0u8; 20];
        tag.copy_from_slice(&bytes[offset..offset + 20]);
        offset += 20;
        debug_assert_eq!(offset, MESSAGE_LEN);
        Self {
            hart,
            kind,
            resource,
            size,
            flags,
            instr_tag,
            time,
            address,
            value,
            buffer,
            tag,
        }
    }
}

/// Implemented by whatever owns the simulated harts and memory; the server only knows how to
/// translate wire messages into calls on this trait and responses back into wire messages.
pub trait CommandTarget {
    fn peek(&mut self, hart: u32, resource: u32, address: u64) -> u64;
    fn poke(&mut self, hart: u32, resource: u32, address: u64, value: u64);
    /// Executes one instruction on `hart` and returns the number of change records produced.
    fn step(&mut self, hart: u32) -> u64;
    fn reset(&mut self, hart: u32);
    /// `true` once every hart has requested `Quit`.
    fn should_quit(&self) -> bool;
}

pub struct Server<T: CommandTarget> {
    target: T,
}

impl<T: CommandTarget> Server<T> {
    pub fn new(target: T) -> Self {
        Self { target }
    }

    pub fn into_target(self) -> T {
        self.target
    }

    /// Processes a single request/reply pair, without performing any I/O of its own. Exposed
    /// separately from [`Self::serve_tcp`] so it can be driven by a shared-memory door-bell loop
    /// as well as by a socket.
    pub fn handle(&mut self, request: &Message) -> Message {
        match request.kind {
            CommandKind::Peek => {
                let value = self.target.peek(request.hart, request.resource, request.address);
                Message::reply(CommandKind::Peek, request.address, value)
            }
            CommandKind::Poke => {
                self.target
                    .poke(request.hart, request.resource, request.address, request.value);
                Message::reply(CommandKind::Poke, request.address, request.value)
            }
            CommandKind::Step => {
                let changes = self.target.step(request.hart);
                Message::reply(CommandKind::ChangeCount, request.address, changes)
            }
            CommandKind::Reset => {
                self.target.reset(request.hart);
                Message::reply(CommandKind::Reset, request.address, 0)
            }
            CommandKind::Quit => Message::reply(CommandKind::Quit, 0, 0),
            _ => Message::reply(CommandKind::Invalid, request.address, 0),
        }
    }

    /// Accepts a single connection on `listener` and serves requests from it until the client
    /// disconnects or sends `Quit`.
    pub fn serve_one(&mut self, listener: &TcpListener) -> io::Result<()> {
        let (mut stream, _) = listener.accept()?;
        self.serve_stream(&mut stream)
    }

    fn serve_stream(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        let mut buf = [0u8; MESSAGE_LEN];
        loop {
            if stream.read_exact(&mut buf).is_err() {
                // Client closed the connection.
                return Ok(());
            }
            let request = Message::from_bytes(&buf);
            let quit = request.kind == CommandKind::Quit;
            let reply = self.handle(&request);
            stream.write_all(&reply.to_bytes())?;
            if quit {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTarget {
        regs: [u64; 32],
        steps: u64,
    }

    impl CommandTarget for FakeTarget {
        fn peek(&mut self, _hart: u32, resource: u32, _address: u64) -> u64 {
            self.regs[resource as usize % 32]
        }

        fn poke(&mut self, _hart: u32, resource: u32, _address: u64, value: u64) {
            self.regs[resource as usize % 32] = value;
        }

        fn step(&mut self, _hart: u32) -> u64 {
            self.steps += 1;
            1
        }

        fn reset(&mut self, _hart: u32) {
            self.regs = [0; 32];
            self.steps = 0;
        }

        fn should_quit(&self) -> bool {
            false
        }
    }

    #[test]
    fn message_round_trips_through_wire_bytes() {
        let message = Message {
            hart: 3,
            kind: CommandKind::Poke,
            resource: 10,
            size: 8,
            flags: 1,
            instr_tag: 99,
            time: 1234,
            address: 0xdead_beef,
            value: 0x1234_5678_9abc_def0,
            buffer: [7; 128],
            tag: [9; 20],
        };
        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), MESSAGE_LEN);
        let round_tripped = Message::from_bytes(&bytes);
        assert_eq!(message, round_tripped);
    }

    #[test]
    fn poke_then_peek_returns_written_value() {
        let mut server = Server::new(FakeTarget { regs: [0; 32], steps: 0 });
        let poke = Message {
            kind: CommandKind::Poke,
            resource: 5,
            value: 42,
            ..Default::default()
        };
        server.handle(&poke);
        let peek = Message {
            kind: CommandKind::Peek,
            resource: 5,
            ..Default::default()
        };
        let reply = server.handle(&peek);
        assert_eq!(reply.value, 42);
    }

    #[test]
    fn step_returns_a_change_count_reply() {
        let mut server = Server::new(FakeTarget { regs: [0; 32], steps: 0 });
        let reply = server.handle(&Message {
            kind: CommandKind::Step,
            ..Default::default()
        });
        assert_eq!(reply.kind, CommandKind::ChangeCount);
        assert_eq!(reply.value, 1);
        assert_eq!(server.into_target().steps, 1);
    }
}
