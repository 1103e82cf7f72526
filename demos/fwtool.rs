// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rustyline::error::ReadlineError;

use fwlauncher::container;
use fwlauncher::hal::{self, Button, ButtonState, FileSystem as _, Row};
use fwlauncher::host::{FileFlash, StdFileSystem};
use fwlauncher::low_level::{self as ll, DataSubtype, PartitionDescriptor, PartitionEntry, PartitionType};
use fwlauncher::{partition_table, Flash, InstallOutcome, Launcher, Layout};

#[derive(Parser)]
struct Fwtool {
    /// Size of the flash image.
    #[clap(long, default_value_t = Layout::DEFAULT_FLASH_CAPACITY)]
    capacity: u32,

    /// Settings partition added to each installed application.
    #[clap(long, default_value_t = Layout::DEFAULT_RESERVED_NVS_SIZE)]
    nvs_size: u32,

    #[clap(short, long)]
    verbose: bool,

    image_file: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Writes a fresh system partition table and an empty app table.
    Init,
    /// Writes raw binaries into the image, as `OFFSET FILE` pairs, e.g. a
    /// bootloader at 0x1000 and the launcher at 0x10000. The sectors each
    /// one covers are erased first.
    Image {
        #[clap(required = true)]
        pieces: Vec<String>,
    },
    /// Parses a container and checks its checksum.
    Info { container: PathBuf },
    List,
    Free,
    Install {
        container: PathBuf,
        /// Also point the partition table and boot selector at it.
        #[clap(long)]
        boot: bool,
    },
    Remove { index: usize },
    EraseAll,
    EraseNvm,
    Defrag,
    /// Prepares the image to boot app `index`, or the launcher if omitted.
    Boot { index: Option<usize> },
    /// Runs the launcher menus on the terminal.
    Shell {
        /// Directory standing in for the SD card's firmware folder.
        #[clap(long, default_value = ".")]
        sd: String,
    },
}

fn main() -> Result<(), anyhow::Error> {
    let args = Fwtool::parse();
    let level = if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .map_err(|e| anyhow!("{e}"))?;

    if args.nvs_size % ll::ERASE_BLOCK_SIZE != 0 {
        bail!("--nvs-size must be a multiple of {:#x}", ll::ERASE_BLOCK_SIZE);
    }

    let mut flash = FileFlash::open(&args.image_file, args.capacity)
        .with_context(|| format!("opening image file {}", args.image_file.display()))?;
    let layout = Layout {
        flash_capacity: args.capacity,
        reserved_nvs_size: args.nvs_size,
        ..Layout::default()
    };

    match args.cmd {
        Cmd::Init => init(&mut flash, &layout)?,
        Cmd::Image { pieces } => image(&mut flash, &pieces)?,
        Cmd::Info { container } => info(&container, &layout)?,
        Cmd::Shell { sd } => {
            let sd: &'static str = Box::leak(sd.into_boxed_str());
            let layout = Layout { firmware_dir: sd, ..layout };
            let mut launcher = Launcher::start(flash, Terminal::new(&[])?, layout)
                .map_err(|e| anyhow!("{e}"))?;
            launcher.run();
        }
        cmd => {
            let script: &[Button] = match &cmd {
                // Confirm, then "go back" at the boot prompt; booting is
                // done separately so nothing restarts.
                Cmd::Install { .. } => &[Button::Start, Button::B][..],
                _ => &[],
            };
            let mut launcher = Launcher::start(flash, Terminal::new(script)?, layout)
                .map_err(|e| anyhow!("{e}"))?;
            command(&mut launcher, cmd).map_err(|e| anyhow!("{e}"))?;
        }
    }
    Ok(())
}

type HostLauncher = Launcher<FileFlash, Terminal>;

fn command(l: &mut HostLauncher, cmd: Cmd) -> Result<(), fwlauncher::Error<std::io::Error>> {
    match cmd {
        Cmd::List => {
            for (i, app) in l.table().apps().iter().enumerate() {
                println!(
                    "{i:3}  {:#08x}-{:#08x}  seq {:<4} {:<40} {}",
                    app.start(),
                    app.end(),
                    app.install_seq.get(),
                    app.description(),
                    app.filename(),
                );
                for p in app.partitions() {
                    println!(
                        "       {:02x}/{:02x} {:<16} {:#x} ({:#x} used)",
                        p.kind, p.subtype, p.label(), p.length.get(), p.data_length.get(),
                    );
                }
            }
            println!("{} of {} slots used", l.table().len(), l.table().capacity());
        }
        Cmd::Free => {
            let space = l.free_space();
            for b in &space.blocks {
                println!("{:#08x}  {:#x}", b.offset, b.size);
            }
            println!("total {:#x} ({})", space.total, fwlauncher::menu::format_size(space.total));
        }
        Cmd::Install { container, boot } => {
            let path = container.to_string_lossy();
            match l.install(&path)? {
                InstallOutcome::Cancelled => println!("cancelled"),
                InstallOutcome::Installed { index, .. } => {
                    println!("installed as app {index}");
                    if boot {
                        l.prepare_boot(Some(index))?;
                        println!("boot prepared");
                    }
                }
            }
        }
        Cmd::Remove { index } => {
            if index >= l.table().len() {
                println!("no app {index}");
            } else {
                let rec = l.remove(index)?;
                println!("removed '{}'", rec.description());
            }
        }
        Cmd::EraseAll => l.erase_all()?,
        Cmd::EraseNvm => {
            if !l.erase_nvm()? {
                println!("no nvs partition");
            }
        }
        Cmd::Defrag => println!("moved {} apps", l.defragment()?),
        Cmd::Boot { index } => {
            if index.map_or(false, |i| i >= l.table().len()) {
                println!("no such app");
            } else {
                l.prepare_boot(index)?;
                println!("boot prepared");
            }
        }
        Cmd::Init | Cmd::Image { .. } | Cmd::Info { .. } | Cmd::Shell { .. } => unreachable!(),
    }
    Ok(())
}

fn system_entry(kind: PartitionType, subtype: u8, offset: u32, size: u32, label: &str) -> PartitionEntry {
    let mut d = PartitionDescriptor::nvs(size);
    d.kind = kind as u8;
    d.subtype = subtype;
    d.label = [0; 16];
    ll::set_c_str(&mut d.label, label);
    PartitionEntry::from_descriptor(offset, &d)
}

fn init(flash: &mut FileFlash, layout: &Layout) -> anyhow::Result<()> {
    let data = PartitionType::Data;
    let entries = [
        system_entry(data, DataSubtype::Nvs as u8, 0x9000, 0x4000, "nvs"),
        system_entry(data, DataSubtype::Ota as u8, 0xD000, 0x2000, "otadata"),
        system_entry(data, DataSubtype::Phy as u8, 0xF000, 0x1000, "phy_init"),
        system_entry(PartitionType::App, 0x00, 0x10000, 0x100000, "factory"),
        system_entry(data, DataSubtype::AppTable as u8, 0x110000, 0x10000, "apptable"),
    ];
    let image = partition_table::build::<std::io::Error>(&entries, u32::MAX, None)
        .map_err(|e| anyhow!("{e}"))?;

    let offset = layout.partition_table_offset;
    flash.erase(offset, ll::ERASE_BLOCK_SIZE)?;
    flash.write(offset, &image)?;
    flash.erase(0x110000, 0x10000)?;
    flash.erase(layout.boot_selector.offset, layout.boot_selector.size)?;
    println!("wrote partition table at {offset:#x}, app table at 0x110000");
    Ok(())
}

fn parse_offset(s: &str) -> anyhow::Result<u32> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.with_context(|| format!("bad offset {s:?}"))
}

fn image(flash: &mut FileFlash, pieces: &[String]) -> anyhow::Result<()> {
    if pieces.len() % 2 != 0 {
        bail!("expected OFFSET FILE pairs");
    }
    for pair in pieces.chunks_exact(2) {
        let offset = parse_offset(&pair[0])?;
        let data = std::fs::read(&pair[1]).with_context(|| format!("reading {}", pair[1]))?;
        let len = u32::try_from(data.len()).context("file too large")?;

        let start = offset / ll::ERASE_BLOCK_SIZE * ll::ERASE_BLOCK_SIZE;
        let end = offset.checked_add(len)
            .and_then(|end| ll::align_up(end, ll::ERASE_BLOCK_SIZE))
            .filter(|&end| end <= flash.capacity())
            .ok_or_else(|| anyhow!("{} does not fit at {offset:#x}", pair[1]))?;
        flash.erase(start, end - start)?;
        flash.write(offset, &data)?;
        println!("offset={offset:#x}, file='{}', size={len:#x}", pair[1]);
    }
    Ok(())
}

fn info(path: &std::path::Path, layout: &Layout) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut file = &data[..];
    let info = container::parse_file(&mut file, layout.reserved_nvs_size)
        .map_err(|e| anyhow!("{}", e.message()))?;

    println!("'{}', {:#x} bytes of flash", info.description(), info.flash_size);
    for p in &info.partitions {
        let d = &p.descriptor;
        println!(
            "  {:02x}/{:02x} {:<16} {:#x} ({:#x} at file offset {:#x})",
            d.kind, d.subtype, d.label(), d.length.get(), d.data_length.get(), p.data_offset,
        );
        if d.data_length.get() > 0 {
            let start = p.data_offset as usize;
            let shown = usize::min(d.data_length.get() as usize, 64);
            println!("{}", pretty_hex::pretty_hex(&&data[start..start + shown]));
        }
    }

    let mut scratch = vec![0; ll::FLASH_BLOCK_SIZE as usize];
    let actual = container::compute_checksum(&mut file, &info, &mut scratch, |_, _| ())
        .map_err(|e| anyhow!("{}", e.message()))?;
    if actual != info.checksum {
        bail!("checksum mismatch: stored {:#010x}, computed {:#010x}", info.checksum, actual);
    }
    println!("checksum {actual:#010x} ok");
    Ok(())
}

/// Board on a terminal: drawing goes to stdout, buttons come from a script
/// and then from the line editor.
struct Terminal {
    rl: rustyline::Editor<()>,
    script: VecDeque<Button>,
    fs: StdFileSystem,
    last_progress: Option<u8>,
}

impl Terminal {
    fn new(script: &[Button]) -> anyhow::Result<Self> {
        Ok(Self {
            rl: rustyline::Editor::<()>::new()?,
            script: script.iter().copied().collect(),
            fs: StdFileSystem,
            last_progress: None,
        })
    }

    fn read_button(&mut self) -> Option<Button> {
        loop {
            match self.rl.readline("button> ") {
                Ok(line) => match parse_button(line.trim()) {
                    Some(b) => return Some(b),
                    None => println!("buttons: up down left right a b start select menu"),
                },
                Err(ReadlineError::Interrupted) => println!("^C"),
                Err(ReadlineError::Eof) => {
                    println!("exiting.");
                    std::process::exit(0);
                }
                Err(e) => {
                    println!("unexpected error: {e:?}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn parse_button(s: &str) -> Option<Button> {
    Some(match s.to_ascii_lowercase().as_str() {
        "up" | "u" => Button::Up,
        "down" | "d" => Button::Down,
        "left" | "l" => Button::Left,
        "right" | "r" => Button::Right,
        "a" => Button::A,
        "b" => Button::B,
        "start" => Button::Start,
        "select" => Button::Select,
        "menu" => Button::Menu,
        _ => return None,
    })
}

impl hal::Display for Terminal {
    fn title(&mut self, title: &str, footer: &str) {
        self.last_progress = None;
        println!("==== {title} ====  {footer}");
    }

    fn header(&mut self, text: &str) {
        println!("  {text}");
    }

    fn footer(&mut self, text: &str) {
        if !text.is_empty() {
            println!("  ({text})");
        }
    }

    fn message(&mut self, text: &str) {
        println!("  {text}");
    }

    fn progress(&mut self, percent: u8) {
        // Only every ten percent, to keep the scrollback readable.
        let bucket = percent / 10;
        if self.last_progress != Some(bucket) {
            self.last_progress = Some(bucket);
            println!("  [{:<10}] {percent}%", "#".repeat(bucket as usize));
        }
    }

    fn tile(&mut self, _tile: &[u8]) {}

    fn row(&mut self, _line: usize, selected: bool, row: &Row<'_>) {
        let mark = if selected { '>' } else { ' ' };
        println!(" {mark} {:<40} {}{}", row.title, row.detail, if row.warn { " !" } else { "" });
    }

    fn dialog(&mut self, options: &[&str], selected: usize) {
        for (i, o) in options.iter().enumerate() {
            println!("  {} {o}", if i == selected { '>' } else { ' ' });
        }
    }

    fn error(&mut self, text: &str) {
        println!("  *** {text} ***");
    }

    fn present(&mut self) {
        let _ = std::io::stdout().flush();
    }
}

impl hal::Input for Terminal {
    fn state(&mut self) -> ButtonState {
        ButtonState::default()
    }

    fn sleep_tick(&mut self) {}

    /// Blocks on the terminal; there's no idle redraw to time out for.
    fn wait_for_press(&mut self, _timeout_ticks: Option<u32>) -> Option<Button> {
        match self.script.pop_front() {
            Some(b) => Some(b),
            None => self.read_button(),
        }
    }
}

impl hal::FileSystem for Terminal {
    type File = <StdFileSystem as hal::FileSystem>::File;

    fn open(&mut self, path: &str) -> Result<Self::File, fwlauncher::FileError> {
        self.fs.open(path)
    }

    fn list(&mut self, dir: &str, extension: &str) -> Result<Vec<String>, fwlauncher::FileError> {
        self.fs.list(dir, extension)
    }
}

impl hal::Platform for Terminal {
    fn restart(&mut self) -> ! {
        println!("restarting into the selected application");
        std::process::exit(0)
    }

    fn halt(&mut self) -> ! {
        println!("halted");
        std::process::exit(1)
    }

    fn set_led(&mut self, on: bool) {
        log::debug!("led {}", if on { "on" } else { "off" });
    }
}
