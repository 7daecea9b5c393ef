//! The `generate` command: publish the update tree for a binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use updelta::{ArtifactBuilder, KeyringView, Platform, TemplateSet, ZstdDelta};

#[derive(Args)]
pub struct GenerateArgs {
    /// Binary to publish
    pub binary: PathBuf,

    /// Output directory for the artifact tree
    #[arg(short, long, default_value = "public")]
    pub output: PathBuf,

    /// Target OS tag (defaults to the running OS)
    #[arg(long)]
    pub os: Option<String>,

    /// Target architecture tag (defaults to the running architecture)
    #[arg(long)]
    pub arch: Option<String>,

    /// Armored keyring enabling payload encryption and manifest signing
    #[arg(long)]
    pub keyring: Option<PathBuf>,

    /// Manifest path template override
    #[arg(long, default_value = "")]
    pub manifest_template: String,

    /// Diff path template override
    #[arg(long, default_value = "")]
    pub diff_template: String,

    /// Blob path template override
    #[arg(long, default_value = "")]
    pub blob_template: String,
}

pub fn run(args: GenerateArgs) -> Result<()> {
    let keyring = match &args.keyring {
        Some(path) => Some(
            KeyringView::from_file(path)
                .with_context(|| format!("read keyring {}", path.display()))?,
        ),
        None => None,
    };

    let templates = TemplateSet::new(
        &args.manifest_template,
        &args.diff_template,
        &args.blob_template,
    )?;

    let current = Platform::current();
    let platform = Platform::new(
        args.os.unwrap_or(current.os_tag),
        args.arch.unwrap_or(current.arch_tag),
    );

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("create output directory {}", args.output.display()))?;

    let codec = ZstdDelta::default();
    let builder = ArtifactBuilder::new(&templates, &codec, keyring.as_ref());
    let hash = builder
        .publish(&args.binary, &platform, &args.output)
        .with_context(|| format!("publish {}", args.binary.display()))?;

    println!("published {hash} for {platform}");
    Ok(())
}
