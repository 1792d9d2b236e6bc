//! Erasure-coding harness over fragment files.
//!
//! Encodes `prefix.d0 .. prefix.d<n-1>` into parity files
//! `prefix.c0 .. prefix.c<m-1>` (with a `.props` sidecar per parity), and
//! repairs missing data files from any k survivors. The core library never
//! sees file names; this shell only hands it readable/writable streams and
//! a presence map.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use quadfec::{FecType, Field, GeneratorKind, Properties, ReedSolomon, F3, F4};

#[derive(Parser, Debug)]
#[command(name = "ec", about = "Reed-Solomon encode/repair over fragment files")]
struct Args {
    /// Field element size in bits (8 or 16).
    #[arg(short = 'e', long, default_value_t = 8)]
    element: u32,

    /// Use the Fermat prime field of matching width (F3 or F4) instead of
    /// GF(2^n).
    #[arg(short = 'f', long)]
    fermat: bool,

    /// Number of data fragments.
    #[arg(short = 'n', long)]
    data: usize,

    /// Number of parity fragments.
    #[arg(short = 'm', long)]
    coding: usize,

    /// Use a Cauchy generator instead of Vandermonde.
    #[arg(short = 's', long)]
    cauchy: bool,

    /// Fragment file prefix.
    #[arg(short = 'p', long)]
    prefix: String,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Encode: create parity files from the data files.
    #[arg(short = 'c', long, conflicts_with = "repair")]
    create: bool,

    /// Repair: rebuild missing data files from survivors.
    #[arg(short = 'r', long)]
    repair: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.create && !args.repair {
        bail!("one of --create or --repair is required");
    }

    let mut code = build_code(&args)?;
    if args.create {
        encode_files(&args, &code)
    } else {
        repair_files(&args, &mut code)
    }
}

fn build_code(args: &Args) -> Result<ReedSolomon<u32>> {
    let field: Arc<Field<u32>> = if args.fermat {
        match args.element {
            8 => Field::fermat_prime(F3),
            16 => Field::fermat_prime(F4),
            other => bail!("unsupported element size {} (use 8 or 16)", other),
        }
    } else {
        match args.element {
            8 | 16 => Field::binary_extension(args.element),
            other => bail!("unsupported element size {} (use 8 or 16)", other),
        }
    }
    .context("field construction failed")?;

    let kind = if args.cauchy {
        GeneratorKind::Cauchy
    } else {
        GeneratorKind::Vandermonde
    };
    let word_size = (args.element / 8) as usize;
    ReedSolomon::new(
        field,
        FecType::Systematic,
        kind,
        args.data,
        args.coding,
        word_size,
        1024,
    )
    .context("invalid code configuration")
}

fn data_path(prefix: &str, i: usize) -> String {
    format!("{}.d{}", prefix, i)
}

fn parity_path(prefix: &str, i: usize) -> String {
    format!("{}.c{}", prefix, i)
}

fn props_path(prefix: &str, i: usize) -> String {
    format!("{}.c{}.props", prefix, i)
}

fn encode_files(args: &Args, code: &ReedSolomon<u32>) -> Result<()> {
    let ws = code.word_size() as u64;
    let mut inputs = Vec::with_capacity(args.data);
    let mut size = None;
    for i in 0..args.data {
        let path = data_path(&args.prefix, i);
        debug!(%path, "opening data fragment");
        let file = File::open(&path).with_context(|| format!("error opening {}", path))?;
        let len = file.metadata()?.len();
        match size {
            None => size = Some(len),
            Some(s) if s != len => bail!("bad size for {}: {} != {}", path, len, s),
            _ => {}
        }
        inputs.push(BufReader::new(file));
    }
    let size = size.unwrap_or(0);
    if size % ws != 0 {
        bail!("data size {} is not a multiple of the word size {}", size, ws);
    }

    let mut outputs = Vec::with_capacity(args.coding);
    for i in 0..args.coding {
        let path = parity_path(&args.prefix, i);
        debug!(%path, "creating parity fragment");
        let file = File::create(&path).with_context(|| format!("error creating {}", path))?;
        outputs.push(BufWriter::new(file));
    }

    let mut props = vec![Properties::new(); code.n_outputs()];
    let stats = code
        .encode_streams(&mut inputs, &mut outputs, &mut props)
        .context("encode failed")?;

    for (i, p) in props.iter().enumerate() {
        let path = props_path(&args.prefix, i);
        let mut file =
            File::create(&path).with_context(|| format!("error creating {}", path))?;
        p.write_to(&mut file)
            .with_context(|| format!("error writing {}", path))?;
    }

    info!(
        bytes = size,
        words = stats.ops,
        throughput = stats.throughput(),
        "encoded {} data fragments into {} parities",
        args.data,
        args.coding
    );
    Ok(())
}

fn repair_files(args: &Args, code: &mut ReedSolomon<u32>) -> Result<()> {
    let mut data_inputs: Vec<Option<BufReader<File>>> = Vec::with_capacity(args.data);
    let mut missing = Vec::new();
    let mut size = None;
    for i in 0..args.data {
        let path = data_path(&args.prefix, i);
        if Path::new(&path).exists() {
            let file = File::open(&path).with_context(|| format!("error opening {}", path))?;
            let len = file.metadata()?.len();
            match size {
                None => size = Some(len),
                Some(s) if s != len => bail!("bad size for {}: {} != {}", path, len, s),
                _ => {}
            }
            data_inputs.push(Some(BufReader::new(file)));
        } else {
            debug!(%path, "data fragment is missing");
            missing.push(i);
            data_inputs.push(None);
        }
    }

    if missing.is_empty() {
        info!("all data fragments present, nothing to repair");
        return Ok(());
    }

    let mut parity_inputs: Vec<Option<BufReader<File>>> = Vec::with_capacity(args.coding);
    let mut parity_props = Vec::with_capacity(args.coding);
    let mut n_coding_ok = 0;
    for i in 0..args.coding {
        let path = parity_path(&args.prefix, i);
        if Path::new(&path).exists() {
            let file = File::open(&path).with_context(|| format!("error opening {}", path))?;
            parity_inputs.push(Some(BufReader::new(file)));
            n_coding_ok += 1;

            let sidecar = props_path(&args.prefix, i);
            let props = if Path::new(&sidecar).exists() {
                let mut file = File::open(&sidecar)
                    .with_context(|| format!("error opening {}", sidecar))?;
                Properties::read_from(&mut file)
                    .with_context(|| format!("error reading {}", sidecar))?
            } else {
                Properties::new()
            };
            parity_props.push(props);
        } else {
            debug!(%path, "parity fragment is missing");
            parity_inputs.push(None);
            parity_props.push(Properties::new());
        }
    }

    if n_coding_ok < missing.len() {
        bail!(
            "too many losses: {} data fragments missing, {} parities available",
            missing.len(),
            n_coding_ok
        );
    }
    debug!(
        data_ok = args.data - missing.len(),
        coding_ok = n_coding_ok,
        "repairing"
    );

    let mut data_outputs: Vec<Option<BufWriter<File>>> = Vec::with_capacity(args.data);
    for i in 0..args.data {
        if missing.contains(&i) {
            let path = data_path(&args.prefix, i);
            let file =
                File::create(&path).with_context(|| format!("error creating {}", path))?;
            data_outputs.push(Some(BufWriter::new(file)));
        } else {
            data_outputs.push(None);
        }
    }

    let stats = code
        .decode_streams(
            &mut data_inputs,
            &mut parity_inputs,
            &parity_props,
            &mut data_outputs,
        )
        .context("repair failed")?;

    info!(
        words = stats.ops,
        throughput = stats.throughput(),
        "rebuilt {} data fragments",
        missing.len()
    );
    Ok(())
}
