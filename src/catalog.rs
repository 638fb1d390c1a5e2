//! Server catalog loading from CSV server lists.
//!
//! Each file is named after the kind it lists, e.g. `stun_v4.csv` or
//! `ntp_v6.csv`, with rows of `host,port[,fqn[,user[,password]]]`.

use crate::uptime::{Credentials, ServerId, ServerKind};

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Catalog error types.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One parsed catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: ServerId,
    pub credentials: Option<Credentials>,
}

/// Every server the dealer monitors, plus the credentials some need.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Deduplicated and sorted.
    pub servers: Vec<ServerId>,
    pub credentials: HashMap<ServerId, Credentials>,
}

/// Load every server list in `dir`.
///
/// A missing directory yields an empty catalog. When a server is listed
/// more than once, the first row that carries credentials wins.
pub fn load_catalog_dir(dir: &Path) -> Result<Catalog, CatalogError> {
    if !dir.exists() {
        tracing::warn!("Catalog directory {} does not exist", dir.display());
        return Ok(Catalog::default());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    paths.sort();

    let mut servers: BTreeMap<ServerId, Option<Credentials>> = BTreeMap::new();
    for path in paths {
        let kind = match path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(kind_from_file_name)
        {
            Some(kind) => kind,
            None => {
                tracing::warn!("Skipping server list with unknown kind: {}", path.display());
                continue;
            }
        };

        let file = File::open(&path).map_err(|source| CatalogError::Io {
            path: path.clone(),
            source,
        })?;
        let parsed = parse_catalog(kind, file)?;
        tracing::info!("Loaded {} {} servers from {}", parsed.len(), kind, path.display());
        for entry in parsed {
            let slot = servers.entry(entry.id).or_default();
            if slot.is_none() {
                *slot = entry.credentials;
            }
        }
    }

    let mut catalog = Catalog::default();
    for (id, credentials) in servers {
        if let Some(credentials) = credentials {
            catalog.credentials.insert(id.clone(), credentials);
        }
        catalog.servers.push(id);
    }
    Ok(catalog)
}

/// The kind a server list holds, from a name like `turn_v6.csv`.
pub fn kind_from_file_name(name: &str) -> Option<ServerKind> {
    let stem = name.strip_suffix(".csv")?;
    let kind = stem.split('_').next()?;
    kind.parse().ok()
}

/// Parse one server list. Malformed rows are logged and skipped.
pub fn parse_catalog<R: Read>(kind: ServerKind, reader: R) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(reader);

    let mut servers = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");

        let mut host = field(0);
        if host.is_empty() || host == "0" {
            host = field(2);
        }
        if host.is_empty() {
            tracing::warn!("Skipping {} row {}: no host", kind, line + 1);
            continue;
        }

        let port = match field(1) {
            "" => kind.default_port(),
            raw => match raw.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    tracing::warn!("Skipping {} row {}: bad port {:?}", kind, line + 1, raw);
                    continue;
                }
            },
        };

        servers.push(CatalogEntry {
            id: ServerId::new(kind, host, port),
            credentials: Credentials::new(field(3), field(4)),
        });
    }

    Ok(servers)
}
