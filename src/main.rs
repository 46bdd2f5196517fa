use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use cta::component::{add_component_versions, ComponentArchive};
use cta::config::RegistryConfig;
use cta::error::{retry, RetryConfig};
use cta::image::{CopyOptions, ImageBuilder, ImageSettings, ManifestStyle, MultiArchBuilder, Platform};
use cta::image::media_types::PREFER_MULTIARCH;
use cta::reference::{ComponentRef, ImageReference, RepositorySpec};
use cta::store::{StoreConnector, StoreFactory};
use cta::transport::{TransportOptions, TransportReport, Transporter};

#[derive(Parser)]
#[command(name = "cta", version, about = "Package and transport software components between OCI registries and transport archives")]
struct Cli {
    /// Registry config file (defaults to $CTA_CONFIG or ~/.ctaconfig)
    #[arg(long, global = true, env = "CTA_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Attempts for operations failing with retryable transport errors
    #[arg(long, global = true, default_value_t = 3)]
    retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an image from directories (one layer each) and push it
    BuildImage {
        /// Target image reference, e.g. localhost:5000/hello:0.1.0
        image: String,
        /// Directories turned into layers, in order
        #[arg(long = "dir", required = true)]
        dirs: Vec<PathBuf>,
        #[arg(long, default_value = "linux")]
        os: String,
        #[arg(long, default_value = "amd64")]
        arch: String,
        #[arg(long)]
        entrypoint: String,
        /// Manifest style: oci or docker (defaults to the config file's style)
        #[arg(long)]
        style: Option<ManifestStyle>,
        /// Store layers as plain tar
        #[arg(long)]
        uncompressed: bool,
    },
    /// Push an index over images already in the repository
    BuildIndex {
        /// Target image reference of the index
        image: String,
        /// `os/arch=<tag or digest>` entries
        #[arg(long = "entry", required = true)]
        entries: Vec<String>,
        #[arg(long)]
        style: Option<ManifestStyle>,
    },
    /// Create an empty component archive
    CreateCa {
        ca: PathBuf,
        name: String,
        version: String,
        #[arg(long)]
        provider: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Add resources from a (multi-document) YAML file to a component archive
    AddResources { ca: PathBuf, file: PathBuf },
    /// Add sources from a YAML file to a component archive
    AddSources { ca: PathBuf, file: PathBuf },
    /// Add component references from a YAML file to a component archive
    AddReferences { ca: PathBuf, file: PathBuf },
    /// Add all component versions of a components file to a transport archive
    AddComponents {
        ctf: PathBuf,
        file: PathBuf,
        #[arg(short, long)]
        force: bool,
    },
    /// Store a component archive in a transport archive
    TransferCa {
        ca: PathBuf,
        ctf: PathBuf,
        #[arg(short, long)]
        force: bool,
    },
    /// Transport every component version of a transport archive
    TransferCtf {
        ctf: PathBuf,
        target: String,
        #[command(flatten)]
        transport: TransportFlags,
    },
    /// Transport a component version, e.g. localhost:5000/ocm//acme.org/app:1.0.0
    Transport {
        component: String,
        target: String,
        #[command(flatten)]
        transport: TransportFlags,
    },
    /// Copy an image or index between registries
    TransferArtifact { source: String, target: String },
    /// Print a component descriptor
    GetComponent { component: String },
}

#[derive(Args)]
struct TransportFlags {
    /// Copy external resources into the target instead of keeping references
    #[arg(long)]
    by_value: bool,
    /// Transport referenced components too
    #[arg(short, long)]
    recursive: bool,
    /// Overwrite component versions present at the target
    #[arg(short, long)]
    force: bool,
}

impl TransportFlags {
    fn options(&self, copy: CopyOptions) -> TransportOptions {
        TransportOptions {
            by_value: self.by_value,
            recursive: self.recursive,
            force: self.force,
            copy,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cta::logging::init_logging(cli.json_logs)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let config = RegistryConfig::load(cli.config.as_deref()).context("loading registry config")?;
    let copy = CopyOptions {
        chunk_size: config.chunk_size,
        concurrency: config.concurrency,
    };
    let default_style = config.style;
    let stores = StoreConnector::new(config);
    let retries = RetryConfig {
        max_attempts: cli.retries.max(1),
        ..RetryConfig::default()
    };

    match cli.command {
        Command::BuildImage {
            image,
            dirs,
            os,
            arch,
            entrypoint,
            style,
            uncompressed,
        } => {
            let image = ImageReference::parse(&image)?;
            let store = stores.open(&RepositorySpec::oci(&image.registry, None))?;
            let pushed = retry(&retries, || {
                let mut builder = ImageBuilder::new(
                    store.as_ref(),
                    &image.repository,
                    style.unwrap_or(default_style),
                )
                .chunk_size(copy.chunk_size)
                .compress(!uncompressed);
                for dir in &dirs {
                    builder.add_layer_dir(dir)?;
                }
                builder.add_config(&ImageSettings::new(&os, &arch, &entrypoint))?;
                builder.push_manifest(&image.reference())
            })?;
            println!("{} {}", image, pushed.descriptor.digest);
        }
        Command::BuildIndex { image, entries, style } => {
            let image = ImageReference::parse(&image)?;
            let store = stores.open(&RepositorySpec::oci(&image.registry, None))?;
            let mut index = MultiArchBuilder::new(
                store.as_ref(),
                &image.repository,
                style.unwrap_or(default_style),
            );
            for entry in &entries {
                let (platform, reference) = entry
                    .split_once('=')
                    .with_context(|| format!("entry '{}' is not os/arch=<reference>", entry))?;
                let (os, arch) = platform
                    .split_once('/')
                    .with_context(|| format!("platform '{}' is not os/arch", platform))?;
                let descriptor = store
                    .head_manifest(&image.repository, reference, &PREFER_MULTIARCH[2..])?
                    .with_context(|| format!("{}:{} not found", image.repository, reference))?;
                index.add_manifest(&descriptor, Platform::new(os, arch))?;
            }
            let pushed = retry(&retries, || index.push(&image.reference()))?;
            println!("{} {}", image, pushed.digest);
        }
        Command::CreateCa {
            ca,
            name,
            version,
            provider,
            force,
        } => {
            ComponentArchive::create(&ca, &name, &version, &provider, force)?;
            println!("created component archive {}", ca.display());
        }
        Command::AddResources { ca, file } => {
            let added = ComponentArchive::open(&ca)?.add_resources_from_file(&file)?;
            println!("added {} resource(s)", added);
        }
        Command::AddSources { ca, file } => {
            let added = ComponentArchive::open(&ca)?.add_sources_from_file(&file)?;
            println!("added {} source(s)", added);
        }
        Command::AddReferences { ca, file } => {
            let added = ComponentArchive::open(&ca)?.add_references_from_file(&file)?;
            println!("added {} reference(s)", added);
        }
        Command::AddComponents { ctf, file, force } => {
            for packed in add_component_versions(&ctf, &file, force)? {
                println!("{}:{} {}", packed.repository, packed.tag, packed.manifest.digest);
            }
        }
        Command::TransferCa { ca, ctf, force } => {
            let packed = ComponentArchive::open(&ca)?.transfer_to_ctf(&ctf, force)?;
            println!("{}:{} {}", packed.repository, packed.tag, packed.manifest.digest);
        }
        Command::TransferCtf {
            ctf,
            target,
            transport,
        } => {
            let target = RepositorySpec::parse(&target)?;
            let options = transport.options(copy);
            let report = retry(&retries, || {
                Transporter::new(&stores).transfer_ctf(&ctf, &target, &options)
            })?;
            print_report(&report);
        }
        Command::Transport {
            component,
            target,
            transport,
        } => {
            let component = ComponentRef::parse(&component)?;
            let target = RepositorySpec::parse(&target)?;
            if component.repository == target {
                bail!("source and target repository are the same: {}", target);
            }
            let options = transport.options(copy);
            let report = retry(&retries, || {
                Transporter::new(&stores).transport(&component, &target, &options)
            })?;
            print_report(&report);
        }
        Command::TransferArtifact { source, target } => {
            let (pushed, metrics) = retry(&retries, || {
                Transporter::new(&stores).transfer_artifact(&source, &target, &copy)
            })?;
            println!(
                "{} {} ({} blobs uploaded, {} skipped)",
                target, pushed.digest, metrics.blobs_uploaded, metrics.blobs_skipped
            );
        }
        Command::GetComponent { component } => {
            let component = ComponentRef::parse(&component)?;
            let descriptor = retry(&retries, || Transporter::new(&stores).get_component(&component))?;
            print!("{}", descriptor.to_yaml()?);
        }
    }
    Ok(())
}

fn print_report(report: &TransportReport) {
    for component in &report.transported {
        println!("transported {}", component);
    }
    for component in &report.skipped {
        println!("skipped {} (present at target)", component);
    }
    println!(
        "{} blob(s) uploaded ({} bytes), {} already present",
        report.metrics.blobs_uploaded, report.metrics.bytes_uploaded, report.metrics.blobs_skipped
    );
}
