//! unlayer CLI - OCI blob store and layer unpacking

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use unlayer::{
    blob_descriptor, compute_diff_id, fsck, get_blob, media_type, put_blob, put_blob_json,
    read_blob, unpack_manifest, Config, Descriptor, Digest, Error, IdMapping, ImageConfig,
    Manifest, MapOptions, Store, UnmappedPolicy,
};

#[derive(Parser)]
#[command(name = "unlayer")]
#[command(about = "unpack OCI image layers into a container bundle root")]
#[command(version)]
struct Cli {
    /// blob store (OCI image layout) path
    #[arg(short, long, default_value = ".", env = "UNLAYER_STORE")]
    store: PathBuf,

    /// more logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new blob store
    Init {
        /// path to create the store at
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// add a file (or stdin with `-`) as a blob
    PutBlob {
        /// file to store
        file: PathBuf,
    },

    /// write a verified blob to stdout
    CatBlob {
        /// blob digest
        digest: Digest,
    },

    /// store a linux config and manifest for existing layer blobs
    NewManifest {
        /// layer blob, `<digest>[:<media-type>]`, bottom layer first
        #[arg(short, long = "layer", required = true)]
        layers: Vec<String>,
    },

    /// unpack a manifest into a bundle root
    Unpack {
        /// manifest blob digest
        manifest: Digest,

        /// destination directory
        bundle: PathBuf,

        /// toml config with mapping and verification settings
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// uid mapping, `container:host:size` (repeatable)
        #[arg(long = "uid-map")]
        uid_map: Vec<IdMapping>,

        /// gid mapping, `container:host:size` (repeatable)
        #[arg(long = "gid-map")]
        gid_map: Vec<IdMapping>,

        /// record what needs privileges instead of failing
        #[arg(long)]
        rootless: bool,

        /// leave owners outside the mapping unchanged instead of failing
        #[arg(long)]
        ignore_unmapped: bool,
    },

    /// verify every blob in the store
    Fsck,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> unlayer::Result<()> {
    match cli.command {
        Commands::Init { path } => {
            Store::init(&path)?;
            println!("initialized blob store at {}", path.display());
        }

        Commands::PutBlob { file } => {
            let store = Store::open(&cli.store)?;
            let _lock = store.lock()?;
            let (digest, size) = if file.as_os_str() == "-" {
                put_blob(&store, &mut io::stdin().lock())?
            } else {
                let mut f = File::open(&file).map_err(|source| Error::Io {
                    path: file.clone(),
                    source,
                })?;
                put_blob(&store, &mut f)?
            };
            println!("{} {}", digest, size);
        }

        Commands::CatBlob { digest } => {
            let store = Store::open(&cli.store)?;
            let mut reader = get_blob(&store, &digest)?;
            let mut stdout = io::stdout().lock();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).map_err(Error::from_stream)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n]).map_err(|source| Error::Io {
                    path: PathBuf::from("<stdout>"),
                    source,
                })?;
            }
            reader.finish()?;
        }

        Commands::NewManifest { layers } => {
            let store = Store::open(&cli.store)?;
            let _lock = store.lock()?;

            let mut descriptors = Vec::new();
            let mut diff_ids = Vec::new();
            for arg in &layers {
                let desc = parse_layer_arg(&store, arg)?;
                diff_ids.push(compute_diff_id(&store, &desc)?);
                descriptors.push(desc);
            }

            let (digest, size) = put_blob_json(&store, &ImageConfig::linux(diff_ids))?;
            let config = Descriptor::new(media_type::IMAGE_CONFIG, digest, size);
            let (digest, _) = put_blob_json(&store, &Manifest::new(config, descriptors))?;
            println!("{}", digest);
        }

        Commands::Unpack {
            manifest,
            bundle,
            config,
            uid_map,
            gid_map,
            rootless,
            ignore_unmapped,
        } => {
            let store = Store::open(&cli.store)?;
            let manifest: Manifest = serde_json::from_slice(&read_blob(&store, &manifest)?)?;

            let mut opts = match &config {
                Some(path) => Config::load(path)?.unpack_options(),
                None => Config::default().unpack_options(),
            };
            if !uid_map.is_empty() || !gid_map.is_empty() {
                opts.map.uid_map = uid_map;
                opts.map.gid_map = gid_map;
            } else if config.is_none() {
                opts.map = MapOptions::rootless_current();
            }
            if rootless {
                opts.map.rootless = true;
            }
            if ignore_unmapped {
                opts.map.unmapped = UnmappedPolicy::Ignore;
            }

            let report = unpack_manifest(&store, &manifest, &bundle, &opts, |_, desc, layer| {
                println!(
                    "layer {} {}: {} entries, {} whiteouts, {} bytes",
                    layer.index,
                    desc.digest.short(),
                    layer.entries,
                    layer.whiteouts,
                    layer.bytes_written
                );
                Ok(())
            })?;

            if report.is_full_fidelity() {
                println!("unpacked {} layers to {}", report.layers.len(), bundle.display());
            } else {
                println!(
                    "unpacked {} layers to {} with degradations:",
                    report.layers.len(),
                    bundle.display()
                );
                for degradation in report.degradations() {
                    println!("  {}", degradation);
                }
            }
        }

        Commands::Fsck => {
            let store = Store::open(&cli.store)?;
            let corrupt = fsck(&store)?;

            if corrupt.is_empty() {
                println!("store is healthy");
            } else {
                println!("corrupt blobs:");
                for blob in &corrupt {
                    println!("  {}: {}", blob.path.display(), blob.reason);
                }
                return Err(Error::CorruptStore(corrupt.len()));
            }
        }
    }

    Ok(())
}

/// `sha256:<hex>` or `sha256:<hex>:<media-type>`, gzip by default
fn parse_layer_arg(store: &Store, arg: &str) -> unlayer::Result<Descriptor> {
    let mut parts = arg.splitn(3, ':');
    let digest = match (parts.next(), parts.next()) {
        (Some(alg), Some(hex)) => Digest::parse(&format!("{}:{}", alg, hex))?,
        _ => return Err(Error::InvalidDigest(arg.to_string())),
    };
    let media = parts.next().unwrap_or(media_type::LAYER_TAR_GZIP);
    blob_descriptor(store, &digest, media)
}
