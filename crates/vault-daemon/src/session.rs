//! Line-delimited JSON requests against a running vault.
//!
//! Each input line is one request object tagged by `op`; an optional `owner`
//! overrides the session's default owner. Each request gets exactly one output line:
//! `{"ok":true,"result":...}` or `{"ok":false,"error":"..."}`.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use vault_core::{Disk, DocumentService};

/// One document operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Write {
        path: String,
        content: String,
        #[serde(default)]
        comment: String,
    },
    Read {
        path: String,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    History {
        path: String,
    },
    Show {
        path: String,
        id: u64,
    },
    Search {
        query: String,
        #[serde(default)]
        regex: bool,
    },
    List {
        #[serde(default)]
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    CreateDir {
        path: String,
    },
    DeleteDir {
        path: String,
    },
    RenameDir {
        from: String,
        to: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    owner: Option<String>,
    #[serde(flatten)]
    request: Request,
}

/// Run `request` for `owner` and return its JSON result.
pub async fn execute<D: Disk>(
    service: &DocumentService<D>,
    owner: &str,
    request: Request,
) -> Result<Value> {
    let value = match request {
        Request::Write {
            path,
            content,
            comment,
        } => serde_json::to_value(service.write(owner, &path, &content, &comment).await?)?,
        Request::Read { path } => serde_json::to_value(service.read(owner, &path).await?.as_ref())?,
        Request::Delete { path } => {
            let recycled = service.delete(owner, &path).await?;
            json!({ "status": "deleted", "recycled": recycled })
        }
        Request::Rename { from, to } => {
            service.rename(owner, &from, &to).await?;
            json!({ "status": "renamed", "from": from, "to": to })
        }
        Request::History { path } => serde_json::to_value(service.history(owner, &path).await?)?,
        Request::Show { path, id } => {
            let content = service.version(owner, &path, id).await?;
            json!({ "id": id, "content": content })
        }
        Request::Search { query, regex } => {
            serde_json::to_value(service.search(owner, &query, regex)?)?
        }
        Request::List { path, recursive } => {
            serde_json::to_value(service.list(owner, &path, recursive).await?)?
        }
        Request::CreateDir { path } => {
            service.create_dir(owner, &path).await?;
            json!({ "status": "created", "path": path })
        }
        Request::DeleteDir { path } => {
            service.delete_dir(owner, &path).await?;
            json!({ "status": "deleted", "path": path })
        }
        Request::RenameDir { from, to } => {
            service.rename_dir(owner, &from, &to).await?;
            json!({ "status": "renamed", "from": from, "to": to })
        }
    };
    Ok(value)
}

/// Answer one request line.
pub async fn handle_line<D: Disk>(
    service: &DocumentService<D>,
    default_owner: &str,
    line: &str,
) -> Value {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Rejected request: {}", e);
            return json!({ "ok": false, "error": format!("Invalid request: {}", e) });
        }
    };
    let owner = envelope.owner.as_deref().unwrap_or(default_owner);
    debug!("Request from {}: {:?}", owner, envelope.request);

    match execute(service, owner, envelope.request).await {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => json!({ "ok": false, "error": format!("{:#}", e) }),
    }
}

/// Serve requests from `input` until it ends, writing one response line per request.
pub async fn serve<D, R, W>(
    service: &DocumentService<D>,
    default_owner: &str,
    input: R,
    mut output: W,
) -> Result<()>
where
    D: Disk,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(service, default_owner, &line).await;
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }
    Ok(())
}
