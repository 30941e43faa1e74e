//! Table Registry Module
//!
//! Built-in and custom tables, their index schemas and expiration policies.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::{parse_duration, parse_expiration, CacheConfig, DEFAULT_EXPIRATION, DEFAULT_EXPIRATION_KEY};
use crate::error::ConfigError;
use crate::storage::{StoredSchema, TableSchema};

/// Reserved table holding engine bookkeeping.
pub const STATE_TABLE: &str = "_state";

/// Key field of the state table.
pub const STATE_KEY_FIELD: &str = "key";

/// Default key field of query tables.
pub const PARAMS_FIELD: &str = "params";

/// Tables created for every engine, one per logical query kind.
pub const BUILTIN_TABLES: &[&str] = &[
    "health",
    "account",
    "accounts",
    "accountAssets",
    "accountTransactions",
    "accountApplications",
    "asset",
    "assets",
    "assetBalances",
    "assetTransactions",
    "block",
    "transaction",
    "transactions",
    "application",
    "applications",
    "applicationLogs",
];

// == Table Definition ==
/// A registered table: schema plus expiration policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub schema: TableSchema,
    /// `None` means entries never expire
    pub ttl: Option<Duration>,
    /// Skipped by pruning
    pub persisted: bool,
}

/// Parses a custom index expression such as `"&address, round"`.
pub fn parse_index(table: &str, index: &str) -> Result<Vec<String>, ConfigError> {
    let fields: Vec<String> = index
        .split(',')
        .map(|f| f.trim().trim_start_matches("++").trim_start_matches('&').trim())
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();

    if fields.is_empty() {
        return Err(ConfigError::InvalidIndex {
            table: table.to_string(),
            index: index.to_string(),
        });
    }
    Ok(fields)
}

// == Table Registry ==
/// Every table the engine knows about.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: BTreeMap<String, TableDef>,
    default_ttl: Option<Duration>,
    expiration: BTreeMap<String, Option<Duration>>,
    persisted: BTreeSet<String>,
    prune_interval: Option<Duration>,
}

impl TableRegistry {
    /// Builds the registry from the static table list plus custom tables.
    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        let default_ttl = parse_expiration(
            config
                .expiration
                .get(DEFAULT_EXPIRATION_KEY)
                .map(String::as_str)
                .unwrap_or(DEFAULT_EXPIRATION),
        )?;

        let mut expiration = BTreeMap::new();
        for (table, value) in &config.expiration {
            if table != DEFAULT_EXPIRATION_KEY {
                expiration.insert(table.clone(), parse_expiration(value)?);
            }
        }

        let prune_interval = config
            .prune_interval
            .as_deref()
            .map(parse_duration)
            .transpose()?;

        let mut registry = Self {
            tables: BTreeMap::new(),
            default_ttl,
            expiration,
            persisted: config.persisted.iter().cloned().collect(),
            prune_interval,
        };

        for name in BUILTIN_TABLES {
            registry.insert(TableSchema::new(*name, &[PARAMS_FIELD]));
        }
        registry.insert(TableSchema::new(STATE_TABLE, &[STATE_KEY_FIELD]));

        for custom in &config.custom_tables {
            let key_fields = match &custom.index {
                Some(index) => parse_index(&custom.name, index)?,
                None => vec![PARAMS_FIELD.to_string()],
            };
            registry.insert(TableSchema {
                name: custom.name.clone(),
                key_fields,
            });
        }

        Ok(registry)
    }

    /// Registers or replaces a table. Returns true when the schema changed.
    pub fn insert(&mut self, schema: TableSchema) -> bool {
        let name = schema.name.clone();
        let is_state = name == STATE_TABLE;
        let def = TableDef {
            ttl: if is_state {
                None
            } else {
                self.expiration
                    .get(&name)
                    .copied()
                    .unwrap_or(self.default_ttl)
            },
            persisted: is_state || self.persisted.contains(&name),
            schema,
        };
        let changed = self.tables.get(&name).map(|d| &d.schema) != Some(&def.schema);
        self.tables.insert(name, def);
        changed
    }

    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn ttl(&self, name: &str) -> Option<Duration> {
        self.tables.get(name).and_then(|d| d.ttl)
    }

    pub fn prune_interval(&self) -> Option<Duration> {
        self.prune_interval
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    pub fn schemas(&self) -> Vec<TableSchema> {
        self.tables.values().map(|d| d.schema.clone()).collect()
    }

    /// Version to open the backend with, given what it has stored.
    ///
    /// An identical stored schema reuses its version; any difference bumps it.
    pub fn version_for(&self, stored: Option<&StoredSchema>) -> u32 {
        match stored {
            None => 1,
            Some(stored) => {
                let mut ours = self.schemas();
                let mut theirs = stored.tables.clone();
                ours.sort_by(|a, b| a.name.cmp(&b.name));
                theirs.sort_by(|a, b| a.name.cmp(&b.name));
                if ours == theirs {
                    stored.version
                } else {
                    stored.version + 1
                }
            }
        }
    }
}
