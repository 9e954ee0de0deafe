//! Cycle-accurate Game Boy / Game Boy Color emulation core.
//!
//! This crate contains the platform-agnostic emulator logic. Hosts drive it
//! through the [`GameBoy`] handle: load a ROM, call [`GameBoy::run_for`] with
//! caller-owned video and audio buffers, and persist battery RAM or save
//! states as they see fit.

/// Audio Processing Unit (APU) emulation.
pub mod apu;

/// Cartridge mappers (MBC) and ROM/RAM handling.
pub mod cartridge;

/// Game Genie and GameShark codes.
pub mod cheats;

/// LR35902 CPU core.
pub mod cpu;

/// High-level facade that wires the CPU and memory into a single machine.
pub mod gameboy;

/// Load flags and hardware model selection.
pub mod hardware;

/// HuC3 clock peripheral.
pub mod huc3;

/// Joypad input register and edge-triggered interrupt behavior.
pub mod input;

/// IF/IE/IME/HALT state.
pub mod interrupts;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// MBC3 real-time clock.
pub mod rtc;

/// Tagged save-state format.
pub mod savestate;

/// Fixed-slot event schedule.
pub mod scheduler;

/// Serial unit and link cable plumbing.
pub mod serial;

/// Divider/timer unit.
pub mod timer;

pub use cartridge::LoadError;
pub use gameboy::GameBoy;
pub use hardware::LoadFlags;
pub use input::InputGetter;
pub use ppu::{ColorCorrection, PixelFormat, SCREEN_HEIGHT, SCREEN_WIDTH};
pub use savestate::StateError;
pub use serial::{NullSerial, SerialIo};
