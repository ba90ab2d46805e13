use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facecheck_core::pipeline::RejectReason;
use facecheck_core::submit::{SubmissionRequest, Submitter};
use facecheck_core::{CosineMatcher, Image, Matcher, Pipeline, PipelineOutcome};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod gallery;
mod submitter;

use config::Config;
use engine::{EngineHandle, LoadPolicy};
use gallery::Gallery;
use submitter::WriterSubmitter;

#[derive(Parser)]
#[command(name = "facecheck", about = "Face detection, alignment and verification")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on an image and print the report
    Detect {
        image: PathBuf,
    },
    /// Enroll the face in an image into the gallery
    Enroll {
        /// Label for this entry (e.g., "normal", "glasses")
        #[arg(short, long)]
        label: String,
        image: PathBuf,
    },
    /// Verify the face in an image against the gallery
    Verify {
        image: PathBuf,
    },
    /// Cosine similarity between the faces in two images
    Similarity {
        a: PathBuf,
        b: PathBuf,
    },
    /// Build a submission request for the face in an image and print it
    Submit {
        /// Identifier sent with the embedding
        #[arg(long)]
        id: String,
        /// Mark the submission for reporting
        #[arg(long)]
        report: bool,
        image: PathBuf,
    },
    /// List gallery entries
    List,
    /// Remove a gallery entry
    Remove {
        /// Entry ID to remove
        id: String,
    },
    /// Show model status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    tracing::debug!(model_dir = %config.model_dir.display(), "configuration loaded");

    match cli.command {
        Commands::List => {
            let gallery = Gallery::load(&config.gallery_path)?;
            let listing: Vec<_> = gallery
                .entries()
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "id": e.id,
                        "label": e.label,
                        "dim": e.embedding.len(),
                    })
                })
                .collect();
            print_json(&listing)?;
        }
        Commands::Remove { id } => {
            let mut gallery = Gallery::load(&config.gallery_path)?;
            if !gallery.remove(&id) {
                bail!("no gallery entry with id {id}");
            }
            gallery.save()?;
            println!("removed {id}");
        }
        Commands::Status => {
            let engine = start_engine(&config, LoadPolicy::Report)?;
            print_json(&engine.status().await?)?;
        }
        command => {
            let engine = start_engine(&config, LoadPolicy::Required)?;
            run_image_command(command, &engine, &config).await?;
        }
    }

    Ok(())
}

async fn run_image_command(
    command: Commands,
    engine: &EngineHandle,
    config: &Config,
) -> Result<()> {
    match command {
        Commands::Detect { image } => {
            let outcome = process(engine, config, &image).await?;
            print_json(&outcome)?;
        }
        Commands::Enroll { label, image } => {
            let outcome = process(engine, config, &image).await?;
            let embedding = accepted_embedding(outcome)?;
            let mut gallery = Gallery::load(&config.gallery_path)?;
            let id = gallery.add(&label, embedding);
            gallery.save()?;
            tracing::info!(%id, %label, "enrolled");
            println!("{id}");
        }
        Commands::Verify { image } => {
            let outcome = process(engine, config, &image).await?;
            let probe = accepted_embedding(outcome)?;
            let gallery = Gallery::load(&config.gallery_path)?;
            if gallery.entries().is_empty() {
                bail!("gallery {} is empty; enroll first", config.gallery_path.display());
            }
            let result =
                CosineMatcher.compare(&probe, gallery.entries(), config.similarity_threshold)?;
            print_json(&result)?;
        }
        Commands::Similarity { a, b } => {
            let first = accepted_embedding(process(engine, config, &a).await?)?;
            let second = accepted_embedding(process(engine, config, &b).await?)?;
            let similarity = first.similarity(&second)?;
            println!("{similarity:.6}");
        }
        Commands::Submit { id, report, image } => {
            let outcome = process(engine, config, &image).await?;
            let request = SubmissionRequest::from_outcome(id, &outcome, report)?;
            let mut sink = WriterSubmitter::new(std::io::stdout().lock());
            let response = sink.submit(&request)?;
            tracing::info!(%response, "submission written");
        }
        Commands::List | Commands::Remove { .. } | Commands::Status => {}
    }
    Ok(())
}

fn start_engine(config: &Config, policy: LoadPolicy) -> Result<EngineHandle> {
    let pipeline = Pipeline::from_model_dir(
        &config.model_dir,
        config.models.clone(),
        config.pipeline.clone(),
    );
    Ok(engine::spawn_engine(pipeline, policy)?)
}

async fn process(engine: &EngineHandle, config: &Config, path: &Path) -> Result<PipelineOutcome> {
    let decoded = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    let image = Image::from(decoded.to_rgb8());
    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "image decoded"
    );
    Ok(engine.process(image, config.timeout()).await?)
}

fn accepted_embedding(outcome: PipelineOutcome) -> Result<facecheck_core::Embedding> {
    match outcome {
        PipelineOutcome::Accepted(report) => report
            .embedding
            .context("embedding model produced no output"),
        PipelineOutcome::NoFace => bail!("no face detected"),
        PipelineOutcome::Rejected { reasons, .. } => {
            bail!("face rejected: {}", describe(&reasons))
        }
    }
}

fn describe(reasons: &[RejectReason]) -> String {
    reasons
        .iter()
        .map(|r| format!("{r:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
