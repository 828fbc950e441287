use std::{
    env, error,
    ffi::OsStr,
    fs,
    io::Read,
    path::Path,
    sync::{Arc, Mutex},
    thread,
};

use emu::gif::{Gif, GifPath};
use emu::memory::BusMemory;
use emu::ring_buffer::QWORD_SIZE;
use emu::savestate::StateArchive;
use emu::vif::registers::{VIF1_STAT, VIF1_TOP};
use emu::vif::{Direction, Vif1};
use emu::vpu::NullVectorUnit;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Quadwords moved by one DMA request.
const DMA_SLICE_QWC: usize = 0x80;

/// Where each slice is staged in main RAM before the transfer.
const DMA_STAGING_ADDRESS: u32 = 0x0010_0000;

const STAT_VIS: u32 = 1 << 10;

fn main() {
    println!("satsuma v0.1.0");

    let mut dump = None;
    let mut log_file = None;
    let mut save_state = None;
    let mut load_state = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-file" => log_file = args.next(),
            "--save-state" => save_state = args.next(),
            "--load-state" => load_state = args.next(),
            _ => dump = Some(arg),
        }
    }

    let _guard = init_logging(log_file.as_deref());

    let Some(name) = dump else {
        println!(
            "usage: satsuma [--log-file <path>] [--load-state <path>] [--save-state <path>] <vif1 dump>"
        );
        std::process::exit(1)
    };

    let data = match read_file(&name) {
        Ok(d) => d,
        Err(e) => {
            println!("{e}");
            std::process::exit(2);
        }
    };
    if data.len() % QWORD_SIZE != 0 {
        tracing::warn!(
            "{} trailing bytes of {name} ignored",
            data.len() % QWORD_SIZE
        );
    }

    if let Err(e) = replay(&data, load_state.as_deref(), save_state.as_deref()) {
        println!("{e}");
        std::process::exit(3);
    }
}

fn init_logging(log_file: Option<&str>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let path = Path::new(path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .unwrap_or_else(|| OsStr::new("satsuma.log"));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn replay(
    data: &[u8],
    load_state: Option<&str>,
    save_state: Option<&str>,
) -> Result<(), Box<dyn error::Error>> {
    let memory = Arc::new(Mutex::new(BusMemory::new()));
    let gif = Arc::new(Gif::new());
    let vif = Vif1::new(1, gif.clone(), Arc::new(NullVectorUnit), memory.clone())?;

    if let Some(path) = load_state {
        let archive = StateArchive::read_from(Path::new(path))?;
        vif.pause_processing();
        let loaded = vif.load_state(&archive);
        vif.resume_processing();
        loaded?;
        tracing::info!("state loaded from {path}");
    }

    let mut transferred = 0;
    for slice in data.chunks(DMA_SLICE_QWC * QWORD_SIZE) {
        let qwc = slice.len() / QWORD_SIZE;
        if qwc == 0 {
            break;
        }
        memory
            .lock()
            .map_err(|_| "bus memory poisoned")?
            .write(DMA_STAGING_ADDRESS, &slice[..qwc * QWORD_SIZE])?;
        transferred += vif.receive_dma(DMA_STAGING_ADDRESS, qwc as u32, Direction::FromMemory, false)?;
    }

    while vif.is_processing() {
        if vif.register(VIF1_STAT) & STAT_VIS != 0 {
            tracing::warn!("stream stalled on an interrupt VIFcode");
            break;
        }
        thread::yield_now();
    }
    if vif.has_failed() {
        return Err("VIF1 consumer thread died".into());
    }

    let transfers = gif.take_transfers();
    let count = |path: GifPath| transfers.iter().filter(|t| t.path == path).count();
    tracing::info!(
        "{transferred} quadwords replayed, GIF received {} (PATH1 {}, PATH2 {}, PATH3 {})",
        transfers.len(),
        count(GifPath::Path1),
        count(GifPath::Path2),
        count(GifPath::Path3),
    );
    tracing::info!(
        "STAT {:#010x} TOP {:#x} state {:?}",
        vif.register(VIF1_STAT),
        vif.register(VIF1_TOP),
        vif.state()
    );

    if let Some(path) = save_state {
        vif.pause_processing();
        let mut archive = StateArchive::new();
        vif.save_state(&mut archive);
        vif.resume_processing();
        archive.write_to(Path::new(path))?;
        tracing::info!("state written to {path}");
    }

    Ok(())
}

fn read_file(filepath: &str) -> Result<Vec<u8>, Box<dyn error::Error>> {
    let mut f = fs::File::open(filepath)?;
    let mut buf = vec![];
    f.read_to_end(&mut buf)?;

    Ok(buf)
}
