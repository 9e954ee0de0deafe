//! Files the runner keeps next to a ROM: battery RAM, clock base time and
//! screenshots.

use gambit_core::{GameBoy, SCREEN_HEIGHT, SCREEN_WIDTH};
use log::{debug, info};
use std::{
    fs::File,
    io::{self, BufWriter, ErrorKind},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavePaths {
    pub battery: PathBuf,
    pub rtc: PathBuf,
}

impl SavePaths {
    /// `<rom>.sav` and `<rom>.rtc`, beside the ROM or inside `dir`.
    pub fn new(rom: &Path, dir: Option<&Path>) -> Self {
        let base = match (dir, rom.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => rom.to_path_buf(),
        };
        Self {
            battery: base.with_extension("sav"),
            rtc: base.with_extension("rtc"),
        }
    }
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_creating_dirs(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)
}

/// Restores battery RAM and the clock base time if the files exist.
pub fn load_battery(gb: &mut GameBoy, paths: &SavePaths) -> io::Result<()> {
    if !gb.save_ram().is_empty()
        && let Some(data) = read_optional(&paths.battery)?
    {
        gb.load_save_ram(&data);
        info!("Loaded battery RAM from {}", paths.battery.display());
    }
    if gb.rtc_base_time().is_some()
        && let Some(data) = read_optional(&paths.rtc)?
    {
        match <[u8; 8]>::try_from(data.as_slice()) {
            Ok(bytes) => gb.set_rtc_base_time(i64::from_be_bytes(bytes)),
            Err(_) => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("{} is not 8 bytes", paths.rtc.display()),
                ));
            }
        }
    }
    Ok(())
}

pub fn save_battery(gb: &GameBoy, paths: &SavePaths) -> io::Result<()> {
    let ram = gb.save_ram();
    if !ram.is_empty() {
        write_creating_dirs(&paths.battery, ram)?;
        debug!("Wrote {} bytes to {}", ram.len(), paths.battery.display());
    }
    if let Some(base_time) = gb.rtc_base_time() {
        write_creating_dirs(&paths.rtc, &base_time.to_be_bytes())?;
    }
    Ok(())
}

/// Writes an XRGB8888 frame as an RGB PNG.
pub fn write_screenshot(path: &Path, frame: &[u32]) -> Result<(), png::EncodingError> {
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(
        BufWriter::new(file),
        SCREEN_WIDTH as u32,
        SCREEN_HEIGHT as u32,
    );
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut pixels = Vec::with_capacity(SCREEN_WIDTH * SCREEN_HEIGHT * 3);
    for c in frame.iter().take(SCREEN_WIDTH * SCREEN_HEIGHT) {
        pixels.push(((c >> 16) & 0xFF) as u8);
        pixels.push(((c >> 8) & 0xFF) as u8);
        pixels.push((c & 0xFF) as u8);
    }
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&pixels)?;
    Ok(())
}
