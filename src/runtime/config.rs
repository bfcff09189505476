// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::std::{
    env,
    fs::File,
    io::Read,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//==============================================================================
// Structures
//==============================================================================

/// Runtime configuration. Parsed once at startup and handed to the runtime
/// constructor; individual services read the knobs they care about.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-node fanout of the broadcast tree.
    pub broadcast_fanout: usize,
    /// Size of a pooled header region (piggyback budget).
    pub header_region_size: usize,
    /// Number of senders kept in the sender pool.
    pub sender_pool_size: usize,
    /// Number of localities the symbol namespace is sharded over.
    pub num_localities: u32,
    /// Identifier of the local locality.
    pub locality_id: u32,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Config {
    /// Reads a configuration file from `config_path`.
    pub fn new(config_path: String) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a configuration from a YAML string.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed YAML config (error={:?})", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => {
                let cause: &str = "wrong number of config objects";
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            },
        };

        let mut me: Self = Self::default();
        if let Some(fanout) = config_obj["taskfabric"]["broadcast_fanout"].as_i64() {
            me.broadcast_fanout = fanout as usize;
        }
        if let Some(size) = config_obj["taskfabric"]["header_region_size"].as_i64() {
            me.header_region_size = size as usize;
        }
        if let Some(size) = config_obj["taskfabric"]["sender_pool_size"].as_i64() {
            me.sender_pool_size = size as usize;
        }
        if let Some(n) = config_obj["taskfabric"]["num_localities"].as_i64() {
            me.num_localities = n as u32;
        }
        if let Some(id) = config_obj["taskfabric"]["locality_id"].as_i64() {
            me.locality_id = id as u32;
        }
        me.apply_env_overrides();

        if me.locality_id >= me.num_localities {
            let cause: String = format!(
                "locality id out of range (locality_id={:?}, num_localities={:?})",
                me.locality_id, me.num_localities
            );
            error!("from_yaml_str(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        Ok(me)
    }

    /// Environment variables take precedence over the configuration file.
    fn apply_env_overrides(&mut self) {
        if let Ok(fanout) = env::var("BROADCAST_FANOUT") {
            if let Ok(fanout) = fanout.parse::<usize>() {
                self.broadcast_fanout = fanout;
            }
        }
        if let Ok(size) = env::var("SENDER_POOL_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                self.sender_pool_size = size;
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_fanout: limits::DEFAULT_BROADCAST_FANOUT,
            header_region_size: limits::HEADER_REGION_SIZE,
            sender_pool_size: limits::DEFAULT_SENDER_POOL_SIZE,
            num_localities: 1,
            locality_id: 0,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
