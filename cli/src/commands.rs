//! Subcommand handlers
//!
//! Each handler runs one orchestrator operation and returns the JSON value
//! printed on stdout.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Subcommand};
use profile_memory::{
    ChunkId, ChunkMetadata, DocumentType, MemoryOrchestrator, MetadataFilter, MetadataValue,
    QueryOptions,
};
use serde_json::{json, Value};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest a document
    Add(AddArgs),
    /// Replace the owner's profile chunks
    SyncProfile(SyncProfileArgs),
    /// Retrieve the chunks most relevant to a query
    Query(QueryArgs),
    /// Delete a document type or specific chunks
    Delete(DeleteArgs),
    /// Show chunk counts for an owner
    Stats(OwnerArg),
}

#[derive(Debug, Args)]
pub struct OwnerArg {
    /// Tenant identifier
    #[arg(long)]
    pub owner: String,
}

/// Document text from an argument, a file, or stdin
#[derive(Debug, Args)]
pub struct ContentArgs {
    /// Inline text
    #[arg(long, conflicts_with = "file")]
    pub text: Option<String>,

    /// Read text from a file
    #[arg(long)]
    pub file: Option<PathBuf>,
}

impl ContentArgs {
    fn read(&self) -> anyhow::Result<String> {
        match (&self.text, &self.file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display())),
            (None, None) => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .context("failed to read stdin")?;
                Ok(text)
            }
        }
    }
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    pub owner: String,

    /// Document type: profile, resume, cover_letter or custom
    #[arg(long = "type", default_value = "custom")]
    pub doc_type: DocumentType,

    /// Collaborator that produced the document
    #[arg(long, default_value = "cli")]
    pub source: String,

    /// Extra metadata as key=value (repeatable)
    #[arg(long = "meta", value_parser = parse_meta)]
    pub meta: Vec<(String, MetadataValue)>,

    #[command(flatten)]
    pub content: ContentArgs,
}

#[derive(Debug, Args)]
pub struct SyncProfileArgs {
    #[arg(long)]
    pub owner: String,

    #[command(flatten)]
    pub content: ContentArgs,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[arg(long)]
    pub owner: String,

    /// Query text
    pub text: String,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub threshold: Option<f32>,

    /// Only search chunks of this document type
    #[arg(long = "type")]
    pub doc_type: Option<DocumentType>,

    /// Print chunks with scores and metadata instead of bare text
    #[arg(long)]
    pub detailed: bool,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    pub owner: String,

    /// Delete every chunk of this document type
    #[arg(long = "type", required_unless_present = "ids", conflicts_with = "ids")]
    pub doc_type: Option<DocumentType>,

    /// Delete these chunk ids
    #[arg(long = "id")]
    pub ids: Vec<ChunkId>,
}

/// Parse `key=value`, typing the value as integer, float, bool or string
fn parse_meta(raw: &str) -> Result<(String, MetadataValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("metadata key must not be empty".to_string());
    }

    let value = if let Ok(i) = value.parse::<i64>() {
        MetadataValue::Integer(i)
    } else if let Ok(x) = value.parse::<f64>() {
        MetadataValue::Float(x)
    } else if let Ok(b) = value.parse::<bool>() {
        MetadataValue::Bool(b)
    } else {
        MetadataValue::from(value)
    };
    Ok((key.to_string(), value))
}

/// Run a subcommand against an open store
pub async fn run(memory: &MemoryOrchestrator, command: Command) -> anyhow::Result<Value> {
    match command {
        Command::Add(args) => add(memory, args).await,
        Command::SyncProfile(args) => {
            let text = args.content.read()?;
            let report = memory.sync_user_profile(&args.owner, &text).await?;
            Ok(serde_json::to_value(report)?)
        }
        Command::Query(args) => query(memory, args).await,
        Command::Delete(args) => delete(memory, args).await,
        Command::Stats(args) => Ok(serde_json::to_value(memory.stats(&args.owner).await?)?),
    }
}

async fn add(memory: &MemoryOrchestrator, args: AddArgs) -> anyhow::Result<Value> {
    let text = args.content.read()?;
    let metadata = args
        .meta
        .into_iter()
        .fold(ChunkMetadata::new(args.doc_type, args.source), |m, (k, v)| {
            m.with(k, v)
        });

    let ids = memory.add_document(&args.owner, &text, metadata).await?;
    Ok(json!({ "owner_id": args.owner, "chunk_ids": ids }))
}

async fn query(memory: &MemoryOrchestrator, args: QueryArgs) -> anyhow::Result<Value> {
    let mut options = QueryOptions {
        top_k: args.top_k,
        similarity_threshold: args.threshold,
        filter: None,
    };
    if let Some(doc_type) = args.doc_type {
        options = options.filter(MetadataFilter::for_type(doc_type));
    }

    let hits = memory.query_detailed(&args.owner, &args.text, options).await?;
    if args.detailed {
        let rows: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "id": hit.chunk.id,
                    "similarity": hit.similarity,
                    "type": hit.chunk.metadata.doc_type,
                    "source": hit.chunk.metadata.source,
                    "content": hit.chunk.content,
                })
            })
            .collect();
        Ok(Value::Array(rows))
    } else {
        let texts: Vec<String> = hits.into_iter().map(|hit| hit.chunk.content).collect();
        Ok(json!(texts))
    }
}

async fn delete(memory: &MemoryOrchestrator, args: DeleteArgs) -> anyhow::Result<Value> {
    let removed = match (args.doc_type, args.ids.is_empty()) {
        (Some(doc_type), _) => memory.delete_document(&args.owner, doc_type).await?,
        (None, false) => memory.delete_chunks(&args.owner, &args.ids).await?,
        (None, true) => bail!("nothing to delete: pass --type or --id"),
    };
    Ok(json!({ "removed": removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{self, ProviderKind, StoreOptions};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> MemoryOrchestrator {
        memory::open(&StoreOptions {
            data_dir: dir.path().to_path_buf(),
            config: None,
            provider: ProviderKind::Local,
            dimension: Some(128),
        })
        .unwrap()
    }

    fn text(value: &str) -> ContentArgs {
        ContentArgs {
            text: Some(value.to_string()),
            file: None,
        }
    }

    #[test]
    fn test_parse_meta() {
        assert_eq!(
            parse_meta("year=2021").unwrap(),
            ("year".to_string(), MetadataValue::Integer(2021))
        );
        assert_eq!(
            parse_meta("score=0.5").unwrap(),
            ("score".to_string(), MetadataValue::Float(0.5))
        );
        assert_eq!(
            parse_meta("remote=true").unwrap(),
            ("remote".to_string(), MetadataValue::Bool(true))
        );
        assert_eq!(
            parse_meta("company=Acme=Corp").unwrap(),
            ("company".to_string(), MetadataValue::from("Acme=Corp"))
        );
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[tokio::test]
    async fn test_add_query_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let memory = open(&dir);

        let added = run(
            &memory,
            Command::Add(AddArgs {
                owner: "u1".into(),
                doc_type: DocumentType::Resume,
                source: "cli".into(),
                meta: vec![("year".into(), MetadataValue::Integer(2024))],
                content: text("Built a Rust search engine"),
            }),
        )
        .await
        .unwrap();
        assert_eq!(added["chunk_ids"].as_array().unwrap().len(), 1);

        let results = run(
            &memory,
            Command::Query(QueryArgs {
                owner: "u1".into(),
                text: "Built a Rust search engine".into(),
                top_k: None,
                threshold: None,
                doc_type: Some(DocumentType::Resume),
                detailed: true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(results[0]["content"], "Built a Rust search engine");
        assert_eq!(results[0]["type"], "resume");

        let deleted = run(
            &memory,
            Command::Delete(DeleteArgs {
                owner: "u1".into(),
                doc_type: Some(DocumentType::Resume),
                ids: vec![],
            }),
        )
        .await
        .unwrap();
        assert_eq!(deleted["removed"], 1);
    }

    #[tokio::test]
    async fn test_sync_profile_and_stats() {
        let dir = TempDir::new().unwrap();
        let memory = open(&dir);

        for version in ["Go developer", "Rust developer"] {
            run(
                &memory,
                Command::SyncProfile(SyncProfileArgs {
                    owner: "u1".into(),
                    content: text(version),
                }),
            )
            .await
            .unwrap();
        }

        let stats = run(&memory, Command::Stats(OwnerArg { owner: "u1".into() }))
            .await
            .unwrap();
        assert_eq!(stats["total_chunks"], 1);
        assert_eq!(stats["by_type"]["profile"], 1);

        let plain = run(
            &memory,
            Command::Query(QueryArgs {
                owner: "u1".into(),
                text: "Rust developer".into(),
                top_k: Some(1),
                threshold: None,
                doc_type: None,
                detailed: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(plain, json!(["Rust developer"]));
    }

    #[tokio::test]
    async fn test_delete_by_ids_respects_owner() {
        let dir = TempDir::new().unwrap();
        let memory = open(&dir);

        let ids = memory
            .add_document("u1", "Rust", ChunkMetadata::new(DocumentType::Custom, "cli"))
            .await
            .unwrap();

        let other = run(
            &memory,
            Command::Delete(DeleteArgs {
                owner: "u2".into(),
                doc_type: None,
                ids: ids.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(other["removed"], 0);

        let own = run(
            &memory,
            Command::Delete(DeleteArgs {
                owner: "u1".into(),
                doc_type: None,
                ids,
            }),
        )
        .await
        .unwrap();
        assert_eq!(own["removed"], 1);
    }
}
