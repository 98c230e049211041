//! Medusa entrypoint: analyze a flat binary and browse the result.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use core_address::Address;
use core_analyzer::Medusa;
use core_arch::{
    Architecture, BareMetalOs, MicroArchitecture, OperatingSystem, PluginRegistry, RawLoader,
};
use core_config::Config;
use core_cpu::RegisterRole;
use core_db::{Database, TextDatabase};
use core_document::CellKind;
use core_emul::Interpreter;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "medusa", version, about = "Interactive disassembler")]
struct Args {
    /// Binary image to analyze.
    pub path: PathBuf,
    /// Configuration file path (overrides discovery of `medusa.toml`).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Text database (`.mdt`) used by the `save` command.
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Entry address override (hex, `base:offset` accepted).
    #[arg(long)]
    pub entry: Option<String>,
    /// Architecture to use; defaults to the loader's first candidate.
    #[arg(long)]
    pub arch: Option<String>,
    /// Map the image at this base address (hex).
    #[arg(long)]
    pub base: Option<String>,
}

/// Structured logs go to `medusa.log`; the terminal stays clean for the
/// listing. The guard must outlive main.
fn init_tracing() -> Option<WorkerGuard> {
    let appender = tracing_appender::rolling::never(".", "medusa.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn build_registry(base: u64) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register_architecture(Arc::new(MicroArchitecture::new()));
    registry.register_loader(Arc::new(RawLoader::new(base)));
    registry
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.parse()
        .map_err(|e| anyhow!("bad address {raw:?}: {e}"))
}

fn print_listing(medusa: &Medusa) {
    let doc = medusa.document();
    let Some(mut addr) = doc.first_address() else {
        println!("(empty document)");
        return;
    };
    loop {
        if let Some(label) = doc.label_at(&addr) {
            println!("{label}:");
        }
        let rendered = medusa
            .format_cell(&addr)
            .unwrap_or_else(|| "??".to_owned());
        let marker = match doc.cell_kind(&addr) {
            Some(CellKind::Instruction) => " ",
            _ => ".",
        };
        let comment = doc
            .comment(&addr)
            .map(|c| format!("  ; {}", c.replace('\n', " ")))
            .unwrap_or_default();
        println!("  {addr} {marker} {rendered}{comment}");
        match doc.next_address(&addr) {
            Some(next) => addr = next,
            None => break,
        }
    }
}

fn print_at(medusa: &Medusa, addr: &Address) {
    let doc = medusa.document();
    if let Some(label) = doc.label_at(addr) {
        println!("{label}:");
    }
    match medusa.format_cell(addr) {
        Some(text) => println!("  {addr}   {text}"),
        None => println!("  {addr}   (unmapped)"),
    }
}

fn database_path(args: &Args) -> PathBuf {
    args.db
        .clone()
        .unwrap_or_else(|| args.path.with_extension("mdt"))
}

fn save(medusa: &Medusa, path: &PathBuf) -> Result<()> {
    let mut db = TextDatabase::new();
    if path.exists() {
        if !db.is_compatible(path) {
            return Err(anyhow!("{} is not a text database", path.display()));
        }
        db.open(path)?;
    } else {
        db.create(path)?;
    }
    medusa.save(&mut db)?;
    db.close()?;
    println!("saved {}", path.display());
    Ok(())
}

/// Steps the interpreter from `entry`, dumping registers after each
/// instruction.
fn emulate(
    medusa: &Medusa,
    architecture: &Arc<dyn Architecture>,
    config: &Config,
    entry: Address,
    max_steps: usize,
) -> Result<()> {
    let doc = medusa.document();
    let mut cpu = architecture.make_cpu_context();
    let mut mem = architecture.make_memory_context();
    mem.map_document(Arc::clone(doc));

    let info = architecture.cpu_information();
    let os = BareMetalOs::new(Arc::clone(&info), 0, (0u32..4).collect());
    os.initialize_context(doc, &mut cpu, &mut mem)?;
    let pc = info
        .register_by_role(RegisterRole::ProgramPointer)
        .ok_or_else(|| anyhow!("architecture has no program pointer"))?;
    cpu.write_register_u64(pc, entry.offset())?;

    let mut interp = Interpreter::new(cpu, mem)
        .with_loop_cap(config.file.evaluator.loop_iteration_cap)
        .with_max_depth(config.file.evaluator.max_visit_depth);
    for step in 0..max_steps {
        let at = Address::flat(interp.cpu().read_register_u64(pc)?);
        match interp.step(doc)? {
            Some(next) => {
                println!(
                    "#{step:<3} {at}  {}",
                    medusa.format_cell(&at).unwrap_or_else(|| "??".to_owned())
                );
                print!("{}", interp.cpu());
                if doc.cell_kind(&next) != Some(CellKind::Instruction) {
                    break;
                }
            }
            None => {
                println!("no instruction at {at}");
                break;
            }
        }
    }
    Ok(())
}

fn repl(
    medusa: &Medusa,
    args: &Args,
    architecture: &Arc<dyn Architecture>,
    config: &Config,
) -> Result<()> {
    let doc = medusa.document();
    let stdin = io::stdin();
    let mut out = io::stdout();
    loop {
        print!("medusa> ");
        out.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            None => continue,
            Some("quit") | Some("q") | Some("exit") => break,
            Some("prev") => match doc.previous_address_in_history() {
                Some(addr) => print_at(medusa, &addr),
                None => println!("history is empty"),
            },
            Some("next") => match doc.next_address_in_history() {
                Some(addr) => print_at(medusa, &addr),
                None => println!("nothing ahead"),
            },
            Some("goto") => {
                let Some(raw) = words.next() else {
                    println!("usage: goto <addr>");
                    continue;
                };
                match parse_address(raw) {
                    Ok(addr) => match doc.nearest_address(&addr) {
                        Some(snapped) => {
                            doc.insert_address_in_history(snapped);
                            print_at(medusa, &snapped);
                        }
                        None => println!("{addr} is not mapped"),
                    },
                    Err(e) => println!("{e}"),
                }
            }
            Some("xref") => {
                let Some(raw) = words.next() else {
                    println!("usage: xref <addr>");
                    continue;
                };
                match parse_address(raw) {
                    Ok(addr) => {
                        let froms = doc.cross_references_from(&addr);
                        if froms.is_empty() {
                            println!("no sites reference {addr}");
                        }
                        for from in froms {
                            println!("{addr} \u{2190} {from}");
                        }
                        if let Some(to) = doc.cross_reference_to(&addr) {
                            println!("{addr} \u{2192} {to}");
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Some("comment") => {
                let Some(raw) = words.next() else {
                    println!("usage: comment <addr> <text>");
                    continue;
                };
                let text: Vec<&str> = words.collect();
                match parse_address(raw) {
                    Ok(addr) => doc.set_comment(&addr, text.join(" ")),
                    Err(e) => println!("{e}"),
                }
            }
            Some("save") => {
                if let Err(e) = save(medusa, &database_path(args)) {
                    error!(target: "db", error = %e, "save failed");
                    println!("save failed: {e}");
                }
            }
            Some("list") => print_listing(medusa),
            Some("emul") => {
                let Some(raw) = words.next() else {
                    println!("usage: emul <addr> [steps]");
                    continue;
                };
                let steps = words
                    .next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(64);
                match parse_address(raw) {
                    Ok(addr) => {
                        if let Err(e) = emulate(medusa, architecture, config, addr, steps) {
                            println!("emulation failed: {e}");
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            Some("help") => {
                println!("commands: goto <addr>, prev, next, xref <addr>, comment <addr> <text>, list, emul <addr> [steps], save, quit");
            }
            Some(other) => println!("unknown command {other:?}, try help"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing();

    let config = core_config::load_from(args.config.clone())?;
    let base = match &args.base {
        Some(raw) => u64::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|_| anyhow!("bad base address {raw:?}"))?,
        None => RawLoader::DEFAULT_BASE,
    };

    let mut medusa = Medusa::with_config(build_registry(base), &config);
    medusa.open(&args.path)?;
    let mapped_entry = medusa.load()?;
    let entry = match &args.entry {
        Some(raw) => parse_address(raw)?,
        None => mapped_entry,
    };

    let architecture = match &args.arch {
        Some(name) => medusa
            .registry()
            .architecture_by_name(name)
            .ok_or_else(|| anyhow!("unknown architecture {name:?}"))?,
        None => medusa
            .registry()
            .architectures()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no architecture registered"))?,
    };

    info!(target: "doc", %entry, arch = architecture.name(), "analyzing");
    println!("analyzing {} from {entry}...", args.path.display());
    medusa.analyze(&architecture, entry);
    medusa.document().insert_address_in_history(entry);

    print_listing(&medusa);
    repl(&medusa, &args, &architecture, &config)?;

    medusa.close();
    Ok(())
}
