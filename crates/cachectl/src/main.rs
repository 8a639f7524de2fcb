mod cli;
mod programs;

use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use clap::Parser;
use codecache::jitalloc::CodeBuffer;
use codecache::{CodeCache, FaultHandlerRegistry, MemoryMap, RegistryError};
use programs::Program;
use toymips::asm::reg;
use toymips::{Halt, Machine, ThreadedRecompiler};

/// Fault handler registry for the threaded recompiler. Its host code reaches guest memory
/// through the bus and never faults, so there is nothing to forward to
/// [`CodeCache::handle_page_fault`] and installing only guards against doing it twice.
#[derive(Debug, Default)]
struct ThreadedFaults {
    installed: bool,
}

impl FaultHandlerRegistry for ThreadedFaults {
    fn install(&mut self) -> Result<(), RegistryError> {
        if self.installed {
            return Err(RegistryError::AlreadyInstalled);
        }

        self.installed = true;
        Ok(())
    }

    fn remove(&mut self) {
        self.installed = false;
    }
}

fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or(EnvFilter::new("cachectl=info,codecache=info,toymips=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .init();
}

fn load_image(config: &cli::Config) -> Result<Option<Program>> {
    let Some(path) = &config.image else {
        return Ok(None);
    };

    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if !bytes.len().is_multiple_of(4) {
        bail!("image size ({} bytes) is not a whole number of words", bytes.len());
    }

    let words = bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();

    Ok(Some(Program {
        entry: config.load_address,
        segments: vec![(config.load_address, words)],
    }))
}

fn main() -> Result<()> {
    setup_tracing();

    let config = cli::Config::parse();
    let program = match load_image(&config)? {
        Some(program) => program,
        None => config.demo.program(),
    };

    let map = MemoryMap::default();
    let mut machine = Machine::new(map.clone());
    for (addr, words) in &program.segments {
        machine
            .load(*addr, words)
            .with_context(|| format!("loading program at {addr:08X}"))?;
    }

    machine.reset(program.entry);
    if let Some(budget) = config.budget {
        machine.extend_budget(budget);
    }

    let buffer_size = usize::try_from(config.cache.code_buffer_size.as_u64())
        .context("code buffer size does not fit in memory")?;
    let buffer = CodeBuffer::new(buffer_size).context("mapping code buffer")?;

    let mut cache = CodeCache::new(map, config.cache.config())
        .with_recompiler(Box::new(ThreadedRecompiler::new()), buffer)
        .with_fault_handler(Box::new(ThreadedFaults::default()));

    cache.initialize(&mut machine);
    tracing::info!("running from {:08X}", program.entry);
    cache.run(&mut machine);

    match machine.halted() {
        Some(Halt::Syscall) | None => (),
        Some(halt) => tracing::warn!("machine stopped abnormally: {halt:?}"),
    }

    let stats = cache.stats();
    println!("retired instructions: {}", machine.cpu.retired);
    println!("blocks:               {}", cache.block_count());
    println!("lookups:              {}", stats.lookups);
    println!("compiles:             {}", stats.compiles);
    println!("revalidations:        {}", stats.revalidations);
    println!("invalidations:        {}", stats.invalidations);
    println!("links followed:       {}", stats.links_followed);
    println!("uncached passes:      {}", stats.uncached_passes);
    println!("flushes:              {}", stats.flushes);
    if let Some(buffer) = cache.code_buffer() {
        println!(
            "host code:            {} of {}",
            ByteSize::b(buffer.used() as u64),
            ByteSize::b(buffer.capacity() as u64)
        );
    }

    println!();
    for (name, r) in [
        ("v0", reg::V0),
        ("v1", reg::V1),
        ("t0", reg::T0),
        ("t1", reg::T1),
        ("ra", reg::RA),
    ] {
        println!("{name} = {:08X}", machine.reg(r));
    }

    Ok(())
}
