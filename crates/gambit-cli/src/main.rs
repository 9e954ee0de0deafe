mod config;
mod storage;

use clap::Parser;
use gambit_core::{GameBoy, LoadFlags, SCREEN_HEIGHT, SCREEN_WIDTH};
use log::{info, warn};
use std::{error::Error, path::PathBuf};

use config::{CliConfig, EmulationMode};
use storage::SavePaths;

/// Stereo samples requested per `run_for` call, about 1/16 of a frame.
const SAMPLES_PER_CALL: usize = 2064;
/// Room for the longest stretch a single call can produce past the request.
const AUDIO_CAPACITY: usize = SAMPLES_PER_CALL + 2064;
const DEFAULT_FRAMES: usize = 60;

#[derive(Parser, Debug)]
#[command(name = "gambit", version, about = "Headless Game Boy / Game Boy Color runner")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Number of video frames to emulate
    #[arg(long)]
    frames: Option<usize>,

    /// Run CGB-capable carts on DMG hardware
    #[arg(long, conflicts_with = "cgb")]
    dmg: bool,

    /// Run DMG carts on CGB hardware
    #[arg(long)]
    cgb: bool,

    /// Use the Game Boy Advance CGB initial state
    #[arg(long)]
    gba: bool,

    /// Detect MBC1 multicart wiring
    #[arg(long)]
    multicart: bool,

    /// Write the last completed frame to this PNG file
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Write a save state on exit
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Restore a save state before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Directory for battery and clock files (defaults to the ROM's)
    #[arg(long)]
    battery_dir: Option<PathBuf>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// `;`-separated Game Genie codes
    #[arg(long)]
    game_genie: Option<String>,

    /// `;`-separated GameShark codes
    #[arg(long)]
    game_shark: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

fn load_flags(args: &Args, cfg: &CliConfig) -> LoadFlags {
    let mut flags = LoadFlags::NONE;
    let mode = if args.dmg {
        EmulationMode::ForceDmg
    } else if args.cgb {
        EmulationMode::ForceCgb
    } else {
        cfg.emulation_mode
    };
    match mode {
        EmulationMode::Auto => {}
        EmulationMode::ForceDmg => flags |= LoadFlags::FORCE_DMG,
        EmulationMode::ForceCgb => flags |= LoadFlags::FORCE_CGB,
    }
    if args.gba {
        flags |= LoadFlags::GBA_CGB;
    }
    if args.multicart {
        flags |= LoadFlags::MULTICART_COMPAT;
    }
    flags
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "warn" }),
    )
    .init();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let cfg = config::load_from_file(&config_path);

    let rom = std::fs::read(&args.rom)?;
    let mut gb = GameBoy::new();
    cfg.apply(&mut gb);
    gb.load(&rom, load_flags(&args, &cfg))?;
    info!(
        "Loaded {} ({})",
        args.rom.display(),
        if gb.is_cgb() { "CGB" } else { "DMG" }
    );

    let battery_dir = args.battery_dir.as_deref().or(cfg.battery_dir.as_deref());
    let paths = SavePaths::new(&args.rom, battery_dir);
    if let Err(e) = storage::load_battery(&mut gb, &paths) {
        warn!("Ignoring battery files: {e}");
    }

    if let Some(path) = &args.load_state {
        let data = std::fs::read(path)?;
        gb.load_state(&data)?;
        info!("Restored state from {}", path.display());
    }
    if let Some(codes) = &args.game_genie {
        gb.set_game_genie(codes);
    }
    if let Some(codes) = &args.game_shark {
        gb.set_game_shark(codes);
    }

    let frames = args.frames.or(cfg.frames).unwrap_or(DEFAULT_FRAMES);
    let mut video = vec![0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
    let mut audio = vec![0u32; AUDIO_CAPACITY];
    let mut completed = 0;
    let mut total_samples = 0usize;
    while completed < frames {
        let mut samples = SAMPLES_PER_CALL;
        if gb.run_for(&mut video, SCREEN_WIDTH, &mut audio, &mut samples) >= 0 {
            completed += 1;
        }
        total_samples += samples;
    }
    info!("Ran {completed} frames, {total_samples} samples");

    if let Some(path) = &args.screenshot {
        storage::write_screenshot(path, &video)?;
        info!("Wrote {}", path.display());
    }
    if let Some(path) = &args.save_state {
        std::fs::write(path, gb.save_state_vec()?)?;
        info!("Wrote state to {}", path.display());
    }
    storage::save_battery(&gb, &paths)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_flags_override_config() {
        let cfg = CliConfig {
            emulation_mode: EmulationMode::ForceCgb,
            ..CliConfig::default()
        };
        let args = Args::parse_from(["gambit", "game.gb", "--dmg", "--multicart"]);
        let flags = load_flags(&args, &cfg);
        assert!(flags.contains(LoadFlags::FORCE_DMG));
        assert!(!flags.contains(LoadFlags::FORCE_CGB));
        assert!(flags.contains(LoadFlags::MULTICART_COMPAT));

        let args = Args::parse_from(["gambit", "game.gb", "--gba"]);
        let flags = load_flags(&args, &cfg);
        assert!(flags.contains(LoadFlags::FORCE_CGB | LoadFlags::GBA_CGB));
    }

    #[test]
    fn dmg_and_cgb_conflict() {
        assert!(Args::try_parse_from(["gambit", "game.gb", "--dmg", "--cgb"]).is_err());
    }
}
