// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow mapper administration library.
//!
//! Loads template databases and mapper configurations from RON, and
//! replays scripts of flow operations against a mapper backed by the
//! recording stub hardware.

use flowmap::api::Fid;
use flowmap::api::FlowType;
use flowmap::api::MapperError;
use flowmap::engine::mapper::FlowCreateOutput;
use flowmap::engine::mapper::FlowCreateParams;
use flowmap::engine::mapper::Mapper;
use flowmap::engine::mapper::MapperCfg;
use flowmap::engine::template::TemplateDb;
use flowmap::provider::NullLog;
use flowmap_test_utils::HwCall;
use flowmap_test_utils::TestEnv;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error("failed to parse {path}: {err}")]
    Parse { path: PathBuf, err: ron::error::SpannedError },

    #[error("mapper: {0}")]
    Mapper(#[from] MapperError),
}

/// Load any RON document from `path`.
pub fn load_ron<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let s = std::fs::read_to_string(path)
        .map_err(|err| Error::Io { path: path.to_path_buf(), err })?;
    ron::from_str(&s)
        .map_err(|err| Error::Parse { path: path.to_path_buf(), err })
}

/// Load and validate a template database.
pub fn load_tdb(path: &Path) -> Result<TemplateDb, Error> {
    let tdb: TemplateDb = load_ron(path)?;
    tdb.validate()?;
    Ok(tdb)
}

/// One operation of a simulation script.
///
/// Flows created by a script are referred to by their position among
/// the script's successful creates, starting at zero.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum SimOp {
    Create(FlowCreateParams),
    Destroy(usize),
    Flush(FlowType),
    FlushFunc(u16),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Script {
    pub cfg: MapperCfg,
    pub ops: Vec<SimOp>,
}

/// The outcome of a single script operation.
#[derive(Clone, Debug)]
pub enum SimResult {
    Created(FlowCreateOutput),
    Destroyed(Fid),
    Flushed(u32),
    Failed(MapperError),
}

/// A mapper wired to the stub backend.
pub struct Sim {
    env: TestEnv,
    mapper: Mapper,
    flows: Vec<(FlowType, Fid)>,
}

impl Sim {
    pub fn new(
        tdb: TemplateDb,
        cfg: MapperCfg,
        verbose: bool,
    ) -> Result<Self, Error> {
        let env = TestEnv::new();
        let mut providers = env.providers();
        if !verbose {
            providers.log = Box::new(NullLog);
        }

        let mapper = Mapper::new("sim", cfg, Arc::new(tdb), providers)?;
        Ok(Self { env, mapper, flows: Vec::new() })
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    /// Every call made against the backend so far.
    pub fn hw_calls(&self) -> Vec<HwCall> {
        self.env.hw.call_log()
    }

    /// The number of backend resources currently allocated.
    pub fn hw_live(&self) -> usize {
        self.env.hw.live()
    }

    pub fn run(&mut self, op: &SimOp) -> SimResult {
        let res = match op {
            SimOp::Create(params) => {
                self.mapper.flow_create(params).map(|out| {
                    self.flows.push((params.flow_type, out.fid));
                    SimResult::Created(out)
                })
            }

            SimOp::Destroy(n) => match self.flows.get(*n) {
                Some((ft, fid)) => self
                    .mapper
                    .flow_destroy(*ft, *fid)
                    .map(|_| SimResult::Destroyed(*fid)),
                None => Err(MapperError::InvalidConfig(format!(
                    "script has no flow #{n}"
                ))),
            },

            SimOp::Flush(ft) => self.mapper.flush(*ft).map(SimResult::Flushed),
            SimOp::FlushFunc(id) => {
                self.mapper.flush_func(*id).map(SimResult::Flushed)
            }
        };

        res.unwrap_or_else(SimResult::Failed)
    }
}
