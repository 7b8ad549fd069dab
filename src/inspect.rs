//! Percolator Inspect: address derivation and ledger-topology verification
//! for the percolator router and slab programs.

#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    use solana_program::pubkey::Pubkey;

    /// Domain separator appended after the program id when hashing seeds.
    pub const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";
    pub const MAX_SEED_LEN: usize = 32;
    /// Includes the trailing bump seed.
    pub const MAX_SEEDS: usize = 16;

    pub const DEFAULT_ROUTER_PROGRAM_ID: Pubkey =
        solana_program::pubkey!("RouterProgram111111111111111111111111111111");
    pub const DEFAULT_SLAB_PROGRAM_ID: Pubkey =
        solana_program::pubkey!("S1abProgram11111111111111111111111111111111");
    pub const DEFAULT_RPC_ENDPOINT: &str = "http://127.0.0.1:8899";
    pub const DEFAULT_FAN_OUT: usize = 8;
    pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 30_000;

    pub const ROUTER: &str = "router";
    pub const SLAB: &str = "slab";

    pub const NODE_VAULT: &str = "vault";
    pub const NODE_REGISTRY: &str = "registry";
    pub const NODE_PORTFOLIO: &str = "portfolio";
    pub const NODE_ESCROW: &str = "escrow";
    pub const NODE_CAP: &str = "cap";
    pub const NODE_SLAB_STATE: &str = "slab-state";
    pub const NODE_AUTHORITY: &str = "authority";
}

// 2. mod error
pub mod error {
    use solana_program::pubkey::Pubkey;
    use std::path::PathBuf;
    use thiserror::Error;

    use crate::schema::TopologyMismatch;

    #[derive(Clone, Debug, Eq, PartialEq, Error)]
    pub enum SeedError {
        #[error("seed {index} is {len} bytes, longer than the {max} byte limit", max = crate::constants::MAX_SEED_LEN)]
        InvalidSeedLength { index: usize, len: usize },
        #[error("{count} seeds exceed the {max} seed limit", max = crate::constants::MAX_SEEDS)]
        TooManySeeds { count: usize },
    }

    #[derive(Clone, Debug, Eq, PartialEq, Error)]
    pub enum DeriveError {
        #[error(transparent)]
        Seed(#[from] SeedError),
        #[error("no bump in 0..=255 yields an off-curve address under {program_id}")]
        DerivationExhausted { program_id: Pubkey },
    }

    #[derive(Clone, Debug, Eq, PartialEq, Error)]
    pub enum SchemaError {
        #[error("schema has a dependency cycle through {nodes:?}")]
        CyclicSchema { nodes: Vec<String> },
        #[error("node `{node}` needs root `{root}`, which was not supplied")]
        UnresolvedRoot { node: String, root: &'static str },
        #[error("node `{node}` references unknown node `{reference}`")]
        UnknownNode { node: String, reference: String },
        #[error("node `{node}` is derived under unknown program slot `{program}`")]
        UnknownProgram { node: String, program: String },
        #[error("node `{node}` is declared more than once")]
        DuplicateNode { node: String },
        #[error("deriving node `{node}` failed: {source}")]
        Derive {
            node: String,
            #[source]
            source: DeriveError,
        },
    }

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("`{field}` is not a valid base58 address: {value:?}")]
        InvalidAddress { field: &'static str, value: String },
        #[error("`{field}` has an invalid value: {value:?}")]
        InvalidValue { field: &'static str, value: String },
        #[error("fan-out limit must be at least 1")]
        ZeroFanOut,
        #[error("invalid seed schema: {0}")]
        Schema(#[from] SchemaError),
        #[error("malformed configuration JSON: {0}")]
        Json(#[from] serde_json::Error),
        #[error("cannot read configuration file {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    #[derive(Clone, Debug, Eq, PartialEq, Error)]
    pub enum TransportError {
        #[error("transport timed out")]
        Timeout,
        #[error("connection failed: {0}")]
        Connection(String),
        #[error("malformed response: {0}")]
        MalformedResponse(String),
        #[error("rpc error {code}: {message}")]
        Rpc { code: i64, message: String },
        #[error("cancelled at the run deadline")]
        Cancelled,
    }

    impl TransportError {
        pub fn is_retryable(&self) -> bool {
            matches!(self, TransportError::Timeout | TransportError::Connection(_))
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq, Error)]
    pub enum SimulateError {
        #[error("target program {program_id} is not executable: {reason}")]
        TargetNotExecutable { program_id: Pubkey, reason: String },
        #[error("simulation transport error: {0}")]
        Transport(#[from] TransportError),
    }

    #[derive(Debug, Error)]
    pub enum InspectError {
        #[error(transparent)]
        Config(#[from] ConfigError),
        #[error("topology is misconfigured: {0}")]
        Schema(#[from] SchemaError),
        #[error("derived topology disagrees with the reference topology at {} node(s)", .mismatches.len())]
        ReferenceMismatch { mismatches: Vec<TopologyMismatch> },
    }
}

// 3. mod seeds (curve-membership hasher)
pub mod seeds {
    use arrayref::array_ref;
    use curve25519_dalek::edwards::CompressedEdwardsY;
    use serde::{Deserialize, Serialize};
    use sha2::{Digest, Sha256};
    use solana_program::pubkey::Pubkey;

    use crate::constants::{MAX_SEEDS, MAX_SEED_LEN, PDA_MARKER};
    use crate::error::SeedError;

    /// One derivation seed. Order within a seed list is significant.
    #[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum SeedComponent {
        Literal(Vec<u8>),
        Address(Pubkey),
        U8(u8),
        U16(u16),
        U32(u32),
        U64(u64),
    }

    impl SeedComponent {
        pub fn literal(bytes: impl AsRef<[u8]>) -> Self {
            SeedComponent::Literal(bytes.as_ref().to_vec())
        }

        pub fn to_bytes(&self) -> Vec<u8> {
            match self {
                SeedComponent::Literal(bytes) => bytes.clone(),
                SeedComponent::Address(key) => key.to_bytes().to_vec(),
                SeedComponent::U8(v) => vec![*v],
                SeedComponent::U16(v) => v.to_le_bytes().to_vec(),
                SeedComponent::U32(v) => v.to_le_bytes().to_vec(),
                SeedComponent::U64(v) => v.to_le_bytes().to_vec(),
            }
        }
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Curve {
        OnCurve,
        OffCurve,
    }

    pub fn check_seeds(seeds: &[&[u8]]) -> Result<(), SeedError> {
        if seeds.len() > MAX_SEEDS {
            return Err(SeedError::TooManySeeds { count: seeds.len() });
        }
        for (index, seed) in seeds.iter().enumerate() {
            if seed.len() > MAX_SEED_LEN {
                return Err(SeedError::InvalidSeedLength { index, len: seed.len() });
            }
        }
        Ok(())
    }

    /// SHA-256 over `seeds || program_id || PDA_MARKER`.
    pub fn hash_seeds(program_id: &Pubkey, seeds: &[&[u8]]) -> Result<[u8; 32], SeedError> {
        check_seeds(seeds)?;
        Ok(hash_unchecked(program_id, seeds))
    }

    pub(crate) fn hash_unchecked(program_id: &Pubkey, seeds: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update(program_id.as_ref());
        hasher.update(PDA_MARKER);
        let digest = hasher.finalize();
        *array_ref![digest, 0, 32]
    }

    /// True when the bytes decode as a compressed Ed25519 point.
    pub fn is_on_curve(bytes: &[u8; 32]) -> bool {
        CompressedEdwardsY(*bytes).decompress().is_some()
    }

    pub fn classify(program_id: &Pubkey, seeds: &[SeedComponent]) -> Result<Curve, SeedError> {
        let encoded: Vec<Vec<u8>> = seeds.iter().map(SeedComponent::to_bytes).collect();
        let slices: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        let digest = hash_seeds(program_id, &slices)?;
        Ok(if is_on_curve(&digest) { Curve::OnCurve } else { Curve::OffCurve })
    }
}

// 4. mod derive
pub mod derive {
    use solana_program::pubkey::Pubkey;

    use crate::error::DeriveError;
    use crate::seeds::{self, SeedComponent};

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct DerivedAddress {
        pub node: String,
        pub program_id: Pubkey,
        pub address: Pubkey,
        pub bump: u8,
    }

    /// Canonical derived address: the first bump, counting down from 255,
    /// whose digest is off the curve.
    pub fn derive(program_id: &Pubkey, seeds: &[SeedComponent]) -> Result<(Pubkey, u8), DeriveError> {
        derive_with(program_id, seeds, seeds::is_on_curve)
    }

    pub fn derive_node(
        node: &str,
        program_id: &Pubkey,
        seeds: &[SeedComponent],
    ) -> Result<DerivedAddress, DeriveError> {
        let (address, bump) = derive(program_id, seeds)?;
        Ok(DerivedAddress { node: node.to_string(), program_id: *program_id, address, bump })
    }

    pub(crate) fn derive_with<F>(
        program_id: &Pubkey,
        seeds: &[SeedComponent],
        on_curve: F,
    ) -> Result<(Pubkey, u8), DeriveError>
    where
        F: Fn(&[u8; 32]) -> bool,
    {
        let encoded: Vec<Vec<u8>> = seeds.iter().map(SeedComponent::to_bytes).collect();
        let base: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();

        let mut checked = base.clone();
        checked.push(&[u8::MAX]);
        seeds::check_seeds(&checked)?;

        for bump in (0..=u8::MAX).rev() {
            let bump_seed = [bump];
            let mut with_bump = base.clone();
            with_bump.push(&bump_seed);
            let digest = seeds::hash_unchecked(program_id, &with_bump);
            if !on_curve(&digest) {
                return Ok((Pubkey::new_from_array(digest), bump));
            }
        }
        Err(DeriveError::DerivationExhausted { program_id: *program_id })
    }
}

// 5. mod schema
pub mod schema {
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;
    use std::collections::{BTreeMap, BTreeSet};
    use tracing::debug;

    use crate::constants::*;
    use crate::derive::{self, DerivedAddress};
    use crate::error::{ConfigError, SchemaError};
    use crate::seeds::SeedComponent;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum RootKey {
        User,
        Mint,
        Market,
        Nonce,
    }

    impl RootKey {
        pub fn name(&self) -> &'static str {
            match self {
                RootKey::User => "user",
                RootKey::Mint => "mint",
                RootKey::Market => "market",
                RootKey::Nonce => "nonce",
            }
        }
    }

    /// A seed as declared in the schema, before roots and upstream
    /// addresses are substituted.
    #[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum SeedSpec {
        Literal(Vec<u8>),
        Root(RootKey),
        Node(String),
        U8(u8),
        U16(u16),
        U32(u32),
        U64(u64),
    }

    impl SeedSpec {
        pub fn literal(bytes: impl AsRef<[u8]>) -> Self {
            SeedSpec::Literal(bytes.as_ref().to_vec())
        }

        pub fn node(name: &str) -> Self {
            SeedSpec::Node(name.to_string())
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub struct DerivationNode {
        pub name: String,
        /// Program slot in the `ProgramSet`, e.g. "router".
        pub program: String,
        pub seeds: Vec<SeedSpec>,
    }

    impl DerivationNode {
        pub fn new(name: &str, program: &str, seeds: Vec<SeedSpec>) -> Self {
            Self { name: name.to_string(), program: program.to_string(), seeds }
        }

        /// Nodes whose derived address feeds this node's seeds.
        pub fn upstream(&self) -> impl Iterator<Item = &str> {
            self.seeds.iter().filter_map(|seed| match seed {
                SeedSpec::Node(name) => Some(name.as_str()),
                _ => None,
            })
        }

        pub fn roots(&self) -> impl Iterator<Item = RootKey> + '_ {
            self.seeds.iter().filter_map(|seed| match seed {
                SeedSpec::Root(key) => Some(*key),
                _ => None,
            })
        }
    }

    #[derive(Clone, Debug, Default, Eq, PartialEq)]
    pub struct Roots {
        pub user: Option<Pubkey>,
        pub mint: Option<Pubkey>,
        pub market: Option<String>,
        pub nonce: Option<u64>,
    }

    impl Roots {
        fn component(&self, key: RootKey) -> Option<SeedComponent> {
            match key {
                RootKey::User => self.user.map(SeedComponent::Address),
                RootKey::Mint => self.mint.map(SeedComponent::Address),
                RootKey::Market => self.market.as_ref().map(|m| SeedComponent::literal(m.as_bytes())),
                RootKey::Nonce => self.nonce.map(SeedComponent::U64),
            }
        }
    }

    /// Program ids keyed by the slot names nodes refer to.
    #[derive(Clone, Debug, Default, Eq, PartialEq)]
    pub struct ProgramSet(BTreeMap<String, Pubkey>);

    impl ProgramSet {
        pub fn new(router: Pubkey, slab: Pubkey) -> Self {
            Self::default().with(ROUTER, router).with(SLAB, slab)
        }

        pub fn with(mut self, slot: &str, program_id: Pubkey) -> Self {
            self.0.insert(slot.to_string(), program_id);
            self
        }

        pub fn get(&self, slot: &str) -> Option<&Pubkey> {
            self.0.get(slot)
        }

        pub fn iter(&self) -> impl Iterator<Item = (&str, &Pubkey)> {
            self.0.iter().map(|(slot, id)| (slot.as_str(), id))
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct TopologyMismatch {
        pub node: String,
        pub expected: Pubkey,
        pub actual: Option<Pubkey>,
    }

    /// Every node's derived address for one set of roots.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct Topology {
        nodes: BTreeMap<String, DerivedAddress>,
        order: Vec<String>,
    }

    impl Topology {
        pub fn get(&self, node: &str) -> Option<&DerivedAddress> {
            self.nodes.get(node)
        }

        pub fn address(&self, node: &str) -> Option<Pubkey> {
            self.nodes.get(node).map(|d| d.address)
        }

        /// In evaluation order.
        pub fn iter(&self) -> impl Iterator<Item = &DerivedAddress> {
            self.order.iter().filter_map(move |name| self.nodes.get(name))
        }

        pub fn len(&self) -> usize {
            self.nodes.len()
        }

        pub fn is_empty(&self) -> bool {
            self.nodes.is_empty()
        }

        pub fn diff(&self, reference: &BTreeMap<String, Pubkey>) -> Vec<TopologyMismatch> {
            reference
                .iter()
                .filter_map(|(node, expected)| {
                    let actual = self.address(node);
                    (actual != Some(*expected)).then(|| TopologyMismatch {
                        node: node.clone(),
                        expected: *expected,
                        actual,
                    })
                })
                .collect()
        }
    }

    #[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
    pub struct SeedSchema {
        nodes: Vec<DerivationNode>,
    }

    impl SeedSchema {
        pub fn new(nodes: Vec<DerivationNode>) -> Self {
            Self { nodes }
        }

        pub fn nodes(&self) -> &[DerivationNode] {
            &self.nodes
        }

        pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
            Ok(serde_json::from_str(json)?)
        }

        /// The seven-node router/slab topology.
        pub fn percolator() -> Self {
            use self::SeedSpec::Root;
            Self::new(vec![
                DerivationNode::new(NODE_VAULT, ROUTER, vec![SeedSpec::literal("vault"), Root(RootKey::Mint)]),
                DerivationNode::new(NODE_REGISTRY, ROUTER, vec![SeedSpec::literal("registry")]),
                DerivationNode::new(NODE_PORTFOLIO, ROUTER, vec![SeedSpec::literal("portfolio"), Root(RootKey::User)]),
                DerivationNode::new(
                    NODE_ESCROW,
                    ROUTER,
                    vec![
                        SeedSpec::literal("escrow"),
                        Root(RootKey::User),
                        SeedSpec::node(NODE_SLAB_STATE),
                        Root(RootKey::Mint),
                    ],
                ),
                DerivationNode::new(
                    NODE_CAP,
                    ROUTER,
                    vec![
                        SeedSpec::literal("cap"),
                        Root(RootKey::User),
                        SeedSpec::node(NODE_SLAB_STATE),
                        Root(RootKey::Mint),
                        Root(RootKey::Nonce),
                    ],
                ),
                DerivationNode::new(NODE_SLAB_STATE, SLAB, vec![SeedSpec::literal("slab"), Root(RootKey::Market)]),
                DerivationNode::new(
                    NODE_AUTHORITY,
                    SLAB,
                    vec![SeedSpec::literal("authority"), SeedSpec::node(NODE_SLAB_STATE)],
                ),
            ])
        }

        /// Validates the graph and returns node indices in dependency order.
        /// Ready nodes are taken in declaration order.
        pub fn evaluation_order(&self, programs: &ProgramSet) -> Result<Vec<usize>, SchemaError> {
            let mut index = BTreeMap::new();
            for (i, node) in self.nodes.iter().enumerate() {
                if index.insert(node.name.as_str(), i).is_some() {
                    return Err(SchemaError::DuplicateNode { node: node.name.clone() });
                }
                if programs.get(&node.program).is_none() {
                    return Err(SchemaError::UnknownProgram {
                        node: node.name.clone(),
                        program: node.program.clone(),
                    });
                }
            }

            let mut pending = vec![0usize; self.nodes.len()];
            let mut dependents = vec![Vec::new(); self.nodes.len()];
            for (i, node) in self.nodes.iter().enumerate() {
                for upstream in node.upstream() {
                    let j = *index.get(upstream).ok_or_else(|| SchemaError::UnknownNode {
                        node: node.name.clone(),
                        reference: upstream.to_string(),
                    })?;
                    pending[i] += 1;
                    dependents[j].push(i);
                }
            }

            let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
            let mut order = Vec::with_capacity(self.nodes.len());
            while let Some(i) = ready.pop_first() {
                order.push(i);
                for &k in &dependents[i] {
                    pending[k] -= 1;
                    if pending[k] == 0 {
                        ready.insert(k);
                    }
                }
            }

            if order.len() != self.nodes.len() {
                let nodes = (0..self.nodes.len())
                    .filter(|&i| pending[i] > 0)
                    .map(|i| self.nodes[i].name.clone())
                    .collect();
                return Err(SchemaError::CyclicSchema { nodes });
            }
            Ok(order)
        }

        pub fn resolve(&self, roots: &Roots, programs: &ProgramSet) -> Result<Topology, SchemaError> {
            let order = self.evaluation_order(programs)?;

            for node in &self.nodes {
                if let Some(missing) = node.roots().find(|&key| roots.component(key).is_none()) {
                    return Err(SchemaError::UnresolvedRoot { node: node.name.clone(), root: missing.name() });
                }
            }

            let mut nodes: BTreeMap<String, DerivedAddress> = BTreeMap::new();
            let mut names = Vec::with_capacity(order.len());
            for i in order {
                let node = &self.nodes[i];
                let program_id = programs.get(&node.program).ok_or_else(|| SchemaError::UnknownProgram {
                    node: node.name.clone(),
                    program: node.program.clone(),
                })?;

                let mut seeds = Vec::with_capacity(node.seeds.len());
                for spec in &node.seeds {
                    let component = match spec {
                        SeedSpec::Literal(bytes) => SeedComponent::Literal(bytes.clone()),
                        SeedSpec::U8(v) => SeedComponent::U8(*v),
                        SeedSpec::U16(v) => SeedComponent::U16(*v),
                        SeedSpec::U32(v) => SeedComponent::U32(*v),
                        SeedSpec::U64(v) => SeedComponent::U64(*v),
                        SeedSpec::Root(key) => roots.component(*key).ok_or(SchemaError::UnresolvedRoot {
                            node: node.name.clone(),
                            root: key.name(),
                        })?,
                        SeedSpec::Node(upstream) => {
                            let derived = nodes.get(upstream).ok_or_else(|| SchemaError::UnknownNode {
                                node: node.name.clone(),
                                reference: upstream.clone(),
                            })?;
                            SeedComponent::Address(derived.address)
                        }
                    };
                    seeds.push(component);
                }

                let derived = derive::derive_node(&node.name, program_id, &seeds)
                    .map_err(|source| SchemaError::Derive { node: node.name.clone(), source })?;
                debug!(node = %node.name, address = %derived.address, bump = derived.bump, "derived node");
                names.push(node.name.clone());
                nodes.insert(node.name.clone(), derived);
            }

            Ok(Topology { nodes, order: names })
        }
    }

    /// Resolves the percolator topology for the given roots and programs.
    pub fn derive_topology(roots: &Roots, programs: &ProgramSet) -> Result<Topology, SchemaError> {
        SeedSchema::percolator().resolve(roots, programs)
    }
}

// 6. mod config
pub mod config {
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;
    use std::path::Path;
    use std::str::FromStr;
    use std::time::Duration;

    use crate::constants::*;
    use crate::error::ConfigError;
    use crate::schema::{ProgramSet, Roots, SeedSchema};

    pub const ENV_RPC_URL: &str = "PERCOLATOR_RPC_URL";
    pub const ENV_ROUTER_PROGRAM_ID: &str = "PERCOLATOR_ROUTER_PROGRAM_ID";
    pub const ENV_SLAB_PROGRAM_ID: &str = "PERCOLATOR_SLAB_PROGRAM_ID";
    pub const ENV_MARKET: &str = "PERCOLATOR_MARKET";
    pub const ENV_USER: &str = "PERCOLATOR_USER";
    pub const ENV_MINT: &str = "PERCOLATOR_MINT";
    pub const ENV_NONCE: &str = "PERCOLATOR_NONCE";
    pub const ENV_ENABLE_SIMULATION: &str = "PERCOLATOR_ENABLE_SIMULATION";
    pub const ENV_FAN_OUT: &str = "PERCOLATOR_FAN_OUT";
    pub const ENV_RUN_TIMEOUT_MS: &str = "PERCOLATOR_RUN_TIMEOUT_MS";

    /// Raw, unvalidated options as they arrive from a file or the environment.
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct InspectorOptions {
        pub rpc_endpoint: Option<String>,
        pub router_program_id: Option<String>,
        pub slab_program_id: Option<String>,
        pub market: Option<String>,
        pub user: Option<String>,
        pub mint: Option<String>,
        pub nonce: Option<u64>,
        pub enable_simulation: Option<bool>,
        pub fan_out: Option<usize>,
        pub run_timeout_ms: Option<u64>,
        pub reference_topology: Option<BTreeMap<String, String>>,
        pub schema: Option<SeedSchema>,
    }

    impl InspectorOptions {
        pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
            Ok(serde_json::from_str(json)?)
        }

        pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
            let path = path.as_ref();
            let raw = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
            Self::from_json_str(&raw)
        }

        pub fn from_env() -> Result<Self, ConfigError> {
            Self::from_vars(|key| std::env::var(key).ok())
        }

        pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
        where
            F: Fn(&str) -> Option<String>,
        {
            Ok(Self {
                rpc_endpoint: var(ENV_RPC_URL),
                router_program_id: var(ENV_ROUTER_PROGRAM_ID),
                slab_program_id: var(ENV_SLAB_PROGRAM_ID),
                market: var(ENV_MARKET),
                user: var(ENV_USER),
                mint: var(ENV_MINT),
                nonce: parse_var(&var, ENV_NONCE)?,
                enable_simulation: parse_var(&var, ENV_ENABLE_SIMULATION)?,
                fan_out: parse_var(&var, ENV_FAN_OUT)?,
                run_timeout_ms: parse_var(&var, ENV_RUN_TIMEOUT_MS)?,
                reference_topology: None,
                schema: None,
            })
        }

        /// Layers `other` on top of `self`; set fields in `other` win.
        pub fn merge(self, other: InspectorOptions) -> Self {
            Self {
                rpc_endpoint: other.rpc_endpoint.or(self.rpc_endpoint),
                router_program_id: other.router_program_id.or(self.router_program_id),
                slab_program_id: other.slab_program_id.or(self.slab_program_id),
                market: other.market.or(self.market),
                user: other.user.or(self.user),
                mint: other.mint.or(self.mint),
                nonce: other.nonce.or(self.nonce),
                enable_simulation: other.enable_simulation.or(self.enable_simulation),
                fan_out: other.fan_out.or(self.fan_out),
                run_timeout_ms: other.run_timeout_ms.or(self.run_timeout_ms),
                reference_topology: other.reference_topology.or(self.reference_topology),
                schema: other.schema.or(self.schema),
            }
        }
    }

    fn parse_var<T, F>(var: &F, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        F: Fn(&str) -> Option<String>,
    {
        var(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|_| ConfigError::InvalidValue { field: key, value: raw.clone() })
            })
            .transpose()
    }

    fn parse_address(field: &'static str, value: Option<&str>) -> Result<Option<Pubkey>, ConfigError> {
        match value.map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Pubkey::from_str(raw)
                .map(Some)
                .map_err(|_| ConfigError::InvalidAddress { field, value: raw.to_string() }),
        }
    }

    /// Validated, immutable configuration for one inspector.
    #[derive(Clone, Debug, PartialEq)]
    pub struct InspectorConfig {
        pub rpc_endpoint: String,
        pub programs: ProgramSet,
        pub roots: Roots,
        pub schema: SeedSchema,
        pub enable_simulation: bool,
        pub fan_out: NonZeroUsize,
        pub run_timeout: Duration,
        pub reference_topology: Option<BTreeMap<String, Pubkey>>,
    }

    impl InspectorConfig {
        /// `identity` stands in for `user` and `mint` when they are not set.
        pub fn from_options(options: InspectorOptions, identity: Option<Pubkey>) -> Result<Self, ConfigError> {
            let router = parse_address("routerProgramId", options.router_program_id.as_deref())?
                .unwrap_or(DEFAULT_ROUTER_PROGRAM_ID);
            let slab = parse_address("slabProgramId", options.slab_program_id.as_deref())?
                .unwrap_or(DEFAULT_SLAB_PROGRAM_ID);
            let programs = ProgramSet::new(router, slab);

            let roots = Roots {
                user: parse_address("user", options.user.as_deref())?.or(identity),
                mint: parse_address("mint", options.mint.as_deref())?.or(identity),
                market: options.market.filter(|m| !m.trim().is_empty()),
                nonce: options.nonce,
            };

            let fan_out = NonZeroUsize::new(options.fan_out.unwrap_or(DEFAULT_FAN_OUT)).ok_or(ConfigError::ZeroFanOut)?;

            let schema = options.schema.unwrap_or_else(SeedSchema::percolator);
            schema.evaluation_order(&programs)?;

            let reference_topology = match options.reference_topology {
                None => None,
                Some(entries) => {
                    let mut parsed = BTreeMap::new();
                    for (node, value) in entries {
                        let address = parse_address("referenceTopology", Some(&value))?
                            .ok_or(ConfigError::InvalidAddress { field: "referenceTopology", value })?;
                        parsed.insert(node, address);
                    }
                    Some(parsed)
                }
            };

            Ok(Self {
                rpc_endpoint: options.rpc_endpoint.unwrap_or_else(|| DEFAULT_RPC_ENDPOINT.to_string()),
                programs,
                roots,
                schema,
                enable_simulation: options.enable_simulation.unwrap_or(false),
                fan_out,
                run_timeout: Duration::from_millis(options.run_timeout_ms.unwrap_or(DEFAULT_RUN_TIMEOUT_MS)),
                reference_topology,
            })
        }
    }
}

// 7. mod ledger (transport seam)
pub mod ledger {
    use async_trait::async_trait;
    use solana_program::{hash::Hash, pubkey::Pubkey};
    use solana_sdk::transaction::{Transaction, TransactionError};
    use std::collections::{HashMap, HashSet};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError, RwLock};
    use std::time::Duration;
    use tokio::time::{sleep, timeout_at, Instant};
    use tracing::warn;

    use crate::error::TransportError;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct RemoteAccount {
        pub lamports: u64,
        pub owner: Pubkey,
        pub executable: bool,
        pub data_len: usize,
    }

    #[derive(Clone, Debug, Default, Eq, PartialEq)]
    pub struct SimulationResponse {
        pub logs: Vec<String>,
        pub err: Option<TransactionError>,
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct ClusterVersion {
        pub solana_core: String,
        pub feature_set: Option<u32>,
    }

    /// Read-only view of a ledger RPC endpoint.
    #[async_trait]
    pub trait LedgerTransport: Send + Sync {
        /// `Ok(None)` when the account does not exist.
        async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RemoteAccount>, TransportError>;
        async fn get_latest_blockhash(&self) -> Result<Hash, TransportError>;
        async fn simulate_transaction(&self, transaction: &Transaction) -> Result<SimulationResponse, TransportError>;
        async fn get_cluster_version(&self) -> Result<ClusterVersion, TransportError>;
    }

    /// Calls not yet started when the deadline passes are never started.
    pub(crate) async fn with_deadline<T, F, Fut>(deadline: Option<Instant>, call: F) -> Result<T, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        match deadline {
            Some(deadline) if Instant::now() >= deadline => Err(TransportError::Cancelled),
            Some(deadline) => timeout_at(deadline, call()).await.unwrap_or(Err(TransportError::Cancelled)),
            None => call().await,
        }
    }

    /// Retries timeouts and connection failures with exponential backoff.
    pub struct RetryingLedger<T> {
        inner: T,
        max_retries: u32,
        base_delay: Duration,
    }

    impl<T: LedgerTransport> RetryingLedger<T> {
        pub fn new(inner: T, max_retries: u32, base_delay: Duration) -> Self {
            Self { inner, max_retries, base_delay }
        }

        pub fn inner(&self) -> &T {
            &self.inner
        }

        async fn retry<R, F, Fut>(&self, method: &'static str, mut call: F) -> Result<R, TransportError>
        where
            F: FnMut() -> Fut + Send,
            Fut: Future<Output = Result<R, TransportError>> + Send,
            R: Send,
        {
            let mut attempt = 0u32;
            loop {
                match call().await {
                    Ok(value) => return Ok(value),
                    Err(err) if err.is_retryable() && attempt < self.max_retries => {
                        let delay = self.base_delay.saturating_mul(1u32 << attempt.min(16));
                        warn!(method, attempt, error = %err, ?delay, "retrying transport call");
                        attempt += 1;
                        sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    #[async_trait]
    impl<T: LedgerTransport> LedgerTransport for RetryingLedger<T> {
        async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RemoteAccount>, TransportError> {
            self.retry("getAccountInfo", move || self.inner.get_account_info(address)).await
        }

        async fn get_latest_blockhash(&self) -> Result<Hash, TransportError> {
            self.retry("getLatestBlockhash", move || self.inner.get_latest_blockhash()).await
        }

        async fn simulate_transaction(&self, transaction: &Transaction) -> Result<SimulationResponse, TransportError> {
            self.retry("simulateTransaction", move || self.inner.simulate_transaction(transaction)).await
        }

        async fn get_cluster_version(&self) -> Result<ClusterVersion, TransportError> {
            self.retry("getVersion", move || self.inner.get_cluster_version()).await
        }
    }

    #[derive(Debug, Default)]
    struct CallCounts {
        account_info: AtomicUsize,
        blockhash: AtomicUsize,
        simulate: AtomicUsize,
        version: AtomicUsize,
    }

    /// In-memory ledger with failure injection, for tests and local
    /// dashboard work.
    #[derive(Debug)]
    pub struct MemoryLedger {
        accounts: RwLock<HashMap<Pubkey, RemoteAccount>>,
        failing: RwLock<HashMap<Pubkey, TransportError>>,
        flaky: Mutex<HashMap<Pubkey, u32>>,
        stalled: RwLock<HashSet<Pubkey>>,
        simulation: RwLock<SimulationResponse>,
        version_failure: RwLock<Option<TransportError>>,
        blockhash: Hash,
        version: ClusterVersion,
        calls: CallCounts,
    }

    impl Default for MemoryLedger {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryLedger {
        pub fn new() -> Self {
            Self {
                accounts: RwLock::new(HashMap::new()),
                failing: RwLock::new(HashMap::new()),
                flaky: Mutex::new(HashMap::new()),
                stalled: RwLock::new(HashSet::new()),
                simulation: RwLock::new(SimulationResponse::default()),
                version_failure: RwLock::new(None),
                blockhash: Hash::new_unique(),
                version: ClusterVersion { solana_core: "1.18.26".to_string(), feature_set: None },
                calls: CallCounts::default(),
            }
        }

        pub fn insert_account(&self, address: Pubkey, account: RemoteAccount) {
            self.accounts.write().unwrap_or_else(PoisonError::into_inner).insert(address, account);
        }

        pub fn insert_program(&self, program_id: Pubkey, loader: Pubkey) {
            self.insert_account(program_id, RemoteAccount { lamports: 1_141_440, owner: loader, executable: true, data_len: 36 });
        }

        pub fn remove_account(&self, address: &Pubkey) {
            self.accounts.write().unwrap_or_else(PoisonError::into_inner).remove(address);
        }

        /// Every read of `address` fails with `err`.
        pub fn fail_address(&self, address: Pubkey, err: TransportError) {
            self.failing.write().unwrap_or_else(PoisonError::into_inner).insert(address, err);
        }

        /// The next `failures` reads of `address` fail with a connection error.
        pub fn flaky_address(&self, address: Pubkey, failures: u32) {
            self.flaky.lock().unwrap_or_else(PoisonError::into_inner).insert(address, failures);
        }

        /// Reads of `address` never complete.
        pub fn stall_address(&self, address: Pubkey) {
            self.stalled.write().unwrap_or_else(PoisonError::into_inner).insert(address);
        }

        pub fn set_simulation(&self, response: SimulationResponse) {
            *self.simulation.write().unwrap_or_else(PoisonError::into_inner) = response;
        }

        pub fn fail_cluster_version(&self, err: TransportError) {
            *self.version_failure.write().unwrap_or_else(PoisonError::into_inner) = Some(err);
        }

        pub fn account_info_calls(&self) -> usize {
            self.calls.account_info.load(Ordering::SeqCst)
        }

        pub fn blockhash_calls(&self) -> usize {
            self.calls.blockhash.load(Ordering::SeqCst)
        }

        pub fn simulate_calls(&self) -> usize {
            self.calls.simulate.load(Ordering::SeqCst)
        }

        pub fn version_calls(&self) -> usize {
            self.calls.version.load(Ordering::SeqCst)
        }

        fn injected_failure(&self, address: &Pubkey) -> Option<TransportError> {
            if let Some(err) = self.failing.read().unwrap_or_else(PoisonError::into_inner).get(address) {
                return Some(err.clone());
            }
            let mut flaky = self.flaky.lock().unwrap_or_else(PoisonError::into_inner);
            match flaky.get_mut(address) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(TransportError::Connection("connection reset".to_string()))
                }
                _ => None,
            }
        }
    }

    #[async_trait]
    impl LedgerTransport for MemoryLedger {
        async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RemoteAccount>, TransportError> {
            self.calls.account_info.fetch_add(1, Ordering::SeqCst);
            let stalled = self.stalled.read().unwrap_or_else(PoisonError::into_inner).contains(address);
            if stalled {
                return futures::future::pending().await;
            }
            if let Some(err) = self.injected_failure(address) {
                return Err(err);
            }
            let account = self.accounts.read().unwrap_or_else(PoisonError::into_inner).get(address).cloned();
            Ok(account)
        }

        async fn get_latest_blockhash(&self) -> Result<Hash, TransportError> {
            self.calls.blockhash.fetch_add(1, Ordering::SeqCst);
            Ok(self.blockhash)
        }

        async fn simulate_transaction(&self, transaction: &Transaction) -> Result<SimulationResponse, TransportError> {
            self.calls.simulate.fetch_add(1, Ordering::SeqCst);
            if transaction.verify().is_err() {
                return Ok(SimulationResponse { logs: Vec::new(), err: Some(TransactionError::SignatureFailure) });
            }
            if transaction.message.recent_blockhash != self.blockhash {
                return Ok(SimulationResponse { logs: Vec::new(), err: Some(TransactionError::BlockhashNotFound) });
            }
            let response = self.simulation.read().unwrap_or_else(PoisonError::into_inner).clone();
            Ok(response)
        }

        async fn get_cluster_version(&self) -> Result<ClusterVersion, TransportError> {
            self.calls.version.fetch_add(1, Ordering::SeqCst);
            let failure = self.version_failure.read().unwrap_or_else(PoisonError::into_inner).clone();
            match failure {
                Some(err) => Err(err),
                None => Ok(self.version.clone()),
            }
        }
    }
}

// 8. mod probe
pub mod probe {
    use futures::stream::{self, StreamExt};
    use solana_program::pubkey::Pubkey;
    use std::collections::{BTreeMap, BTreeSet};
    use std::num::NonZeroUsize;
    use tokio::time::Instant;
    use tracing::{debug, warn};

    use crate::error::TransportError;
    use crate::ledger::{with_deadline, LedgerTransport, RemoteAccount};

    /// Point-in-time snapshot of one account.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AccountObservation {
        pub exists: bool,
        pub owner: Option<Pubkey>,
        pub executable: bool,
        pub data_len: usize,
        pub lamports: u64,
    }

    impl AccountObservation {
        pub fn absent() -> Self {
            Self { exists: false, owner: None, executable: false, data_len: 0, lamports: 0 }
        }

        pub fn from_remote(account: &RemoteAccount) -> Self {
            Self {
                exists: true,
                owner: Some(account.owner),
                executable: account.executable,
                data_len: account.data_len,
                lamports: account.lamports,
            }
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum ProbeOutcome {
        Observed(AccountObservation),
        Failed(TransportError),
    }

    impl ProbeOutcome {
        pub fn observation(&self) -> Option<&AccountObservation> {
            match self {
                ProbeOutcome::Observed(obs) => Some(obs),
                ProbeOutcome::Failed(_) => None,
            }
        }
    }

    pub async fn probe_one<L>(ledger: &L, address: &Pubkey, deadline: Option<Instant>) -> ProbeOutcome
    where
        L: LedgerTransport + ?Sized,
    {
        match with_deadline(deadline, move || ledger.get_account_info(address)).await {
            Ok(Some(account)) => {
                debug!(%address, owner = %account.owner, executable = account.executable, "account observed");
                ProbeOutcome::Observed(AccountObservation::from_remote(&account))
            }
            Ok(None) => {
                debug!(%address, "account absent");
                ProbeOutcome::Observed(AccountObservation::absent())
            }
            Err(err) => {
                warn!(%address, error = %err, "probe failed");
                ProbeOutcome::Failed(err)
            }
        }
    }

    /// Reads every address with at most `fan_out` reads in flight. One
    /// failed read never hides the others.
    pub async fn probe<L, I>(
        ledger: &L,
        addresses: I,
        fan_out: NonZeroUsize,
        deadline: Option<Instant>,
    ) -> BTreeMap<Pubkey, ProbeOutcome>
    where
        L: LedgerTransport + ?Sized,
        I: IntoIterator<Item = Pubkey>,
    {
        let unique: BTreeSet<Pubkey> = addresses.into_iter().collect();
        stream::iter(unique)
            .map(|address| async move { (address, probe_one(ledger, &address, deadline).await) })
            .buffer_unordered(fan_out.get())
            .collect()
            .await
    }
}

// 9. mod report
pub mod report {
    use solana_program::pubkey::Pubkey;
    use std::collections::BTreeMap;
    use std::fmt;

    use crate::error::TransportError;
    use crate::ledger::ClusterVersion;
    use crate::probe::ProbeOutcome;
    use crate::schema::{ProgramSet, Topology};
    use crate::simulate::SimulationOutcome;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum NodeStatus {
        MatchesExpectedOwner,
        Absent,
        OwnerMismatch { expected: Pubkey, actual: Pubkey },
        UnexpectedlyExecutable,
        ProbeFailed(TransportError),
    }

    impl NodeStatus {
        pub fn classify(expected_owner: &Pubkey, outcome: &ProbeOutcome) -> Self {
            let obs = match outcome {
                ProbeOutcome::Failed(err) => return NodeStatus::ProbeFailed(err.clone()),
                ProbeOutcome::Observed(obs) => obs,
            };
            if !obs.exists {
                return NodeStatus::Absent;
            }
            if obs.executable {
                return NodeStatus::UnexpectedlyExecutable;
            }
            match obs.owner {
                Some(owner) if owner != *expected_owner => {
                    NodeStatus::OwnerMismatch { expected: *expected_owner, actual: owner }
                }
                _ => NodeStatus::MatchesExpectedOwner,
            }
        }

        pub fn finding(&self) -> Finding {
            match self {
                NodeStatus::MatchesExpectedOwner => Finding::Healthy,
                NodeStatus::Absent => Finding::NotCreated,
                NodeStatus::OwnerMismatch { .. } | NodeStatus::UnexpectedlyExecutable => Finding::Misconfigured,
                NodeStatus::ProbeFailed(_) => Finding::Unreachable,
            }
        }
    }

    impl fmt::Display for NodeStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                NodeStatus::MatchesExpectedOwner => write!(f, "matches expected owner"),
                NodeStatus::Absent => write!(f, "absent"),
                NodeStatus::OwnerMismatch { expected, actual } => {
                    write!(f, "owner mismatch: expected {expected}, found {actual}")
                }
                NodeStatus::UnexpectedlyExecutable => write!(f, "unexpectedly executable"),
                NodeStatus::ProbeFailed(err) => write!(f, "probe failed: {err}"),
            }
        }
    }

    /// Which family a node status belongs to. Absent accounts are an
    /// operational fact, not a fault.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Finding {
        Healthy,
        NotCreated,
        Misconfigured,
        Unreachable,
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum ProgramStatus {
        Executable,
        NotExecutable,
        NotFound,
        Unreachable(TransportError),
    }

    impl ProgramStatus {
        pub fn classify(outcome: &ProbeOutcome) -> Self {
            match outcome {
                ProbeOutcome::Failed(err) => ProgramStatus::Unreachable(err.clone()),
                ProbeOutcome::Observed(obs) if !obs.exists => ProgramStatus::NotFound,
                ProbeOutcome::Observed(obs) if obs.executable => ProgramStatus::Executable,
                ProbeOutcome::Observed(_) => ProgramStatus::NotExecutable,
            }
        }

        pub fn is_executable(&self) -> bool {
            matches!(self, ProgramStatus::Executable)
        }
    }

    impl fmt::Display for ProgramStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ProgramStatus::Executable => write!(f, "executable"),
                ProgramStatus::NotExecutable => write!(f, "not executable"),
                ProgramStatus::NotFound => write!(f, "not executable / not found"),
                ProgramStatus::Unreachable(err) => write!(f, "unreachable: {err}"),
            }
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct ProgramReport {
        pub slot: String,
        pub program_id: Pubkey,
        pub outcome: ProbeOutcome,
        pub status: ProgramStatus,
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum DryRunStatus {
        Disabled,
        Skipped { reason: String },
        Completed(SimulationOutcome),
        Failed(TransportError),
    }

    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ReportSummary {
        pub matching: usize,
        pub absent: usize,
        pub misconfigured: usize,
        pub unreachable: usize,
    }

    impl fmt::Display for ReportSummary {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} account(s) as expected", self.matching)?;
            if self.absent > 0 {
                write!(f, "; {} not yet created on this ledger", self.absent)?;
            }
            if self.misconfigured > 0 {
                write!(f, "; {} disagree with the derived topology (owner or executable flag)", self.misconfigured)?;
            }
            if self.unreachable > 0 {
                write!(f, "; {} could not be read (transport unreachable)", self.unreachable)?;
            }
            Ok(())
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct TopologyReport {
        pub topology: Topology,
        pub observations: BTreeMap<String, ProbeOutcome>,
        pub statuses: BTreeMap<String, NodeStatus>,
        pub programs: Vec<ProgramReport>,
        pub cluster_version: Option<ClusterVersion>,
    }

    impl TopologyReport {
        /// Nodes are expected to be non-executable and owned by the program
        /// they were derived under.
        pub fn build(
            topology: Topology,
            programs: &ProgramSet,
            outcomes: &BTreeMap<Pubkey, ProbeOutcome>,
            cluster_version: Option<ClusterVersion>,
        ) -> Self {
            let lookup = |address: &Pubkey| {
                outcomes.get(address).cloned().unwrap_or(ProbeOutcome::Failed(TransportError::Cancelled))
            };

            let mut observations = BTreeMap::new();
            let mut statuses = BTreeMap::new();
            for derived in topology.iter() {
                let outcome = lookup(&derived.address);
                statuses.insert(derived.node.clone(), NodeStatus::classify(&derived.program_id, &outcome));
                observations.insert(derived.node.clone(), outcome);
            }

            let programs = programs
                .iter()
                .map(|(slot, program_id)| {
                    let outcome = lookup(program_id);
                    ProgramReport {
                        slot: slot.to_string(),
                        program_id: *program_id,
                        status: ProgramStatus::classify(&outcome),
                        outcome,
                    }
                })
                .collect();

            Self { topology, observations, statuses, programs, cluster_version }
        }

        pub fn status(&self, node: &str) -> Option<&NodeStatus> {
            self.statuses.get(node)
        }

        pub fn observation(&self, node: &str) -> Option<&ProbeOutcome> {
            self.observations.get(node)
        }

        pub fn program(&self, slot: &str) -> Option<&ProgramReport> {
            self.programs.iter().find(|p| p.slot == slot)
        }

        pub fn summary(&self) -> ReportSummary {
            let mut summary = ReportSummary::default();
            for status in self.statuses.values() {
                match status.finding() {
                    Finding::Healthy => summary.matching += 1,
                    Finding::NotCreated => summary.absent += 1,
                    Finding::Misconfigured => summary.misconfigured += 1,
                    Finding::Unreachable => summary.unreachable += 1,
                }
            }
            summary
        }
    }
}

// 10. mod simulate
pub mod simulate {
    use solana_program::{
        hash::Hash,
        instruction::{AccountMeta, Instruction},
        pubkey::Pubkey,
    };
    use solana_sdk::{
        signature::{Keypair, Signer},
        transaction::{Transaction, TransactionError},
    };
    use tokio::time::Instant;
    use tracing::{debug, info};

    use crate::error::SimulateError;
    use crate::ledger::{with_deadline, LedgerTransport};
    use crate::probe::ProbeOutcome;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct SimulationOutcome {
        pub succeeded: bool,
        pub log_lines: Vec<String>,
        pub error: Option<TransactionError>,
    }

    /// Empty payload; the fee payer is the only account, signing and
    /// read-only.
    pub fn probe_instruction(program_id: &Pubkey, fee_payer: &Pubkey) -> Instruction {
        Instruction {
            program_id: *program_id,
            accounts: vec![AccountMeta::new_readonly(*fee_payer, true)],
            data: Vec::new(),
        }
    }

    pub fn probe_transaction(program_id: &Pubkey, identity: &Keypair, recent_blockhash: Hash) -> Transaction {
        let payer = identity.pubkey();
        let ix = probe_instruction(program_id, &payer);
        Transaction::new_signed_with_payer(&[ix], Some(&payer), &[identity], recent_blockhash)
    }

    /// Refuses unless the latest observation of `program_id` is executable.
    pub fn check_target(program_id: &Pubkey, latest: &ProbeOutcome) -> Result<(), SimulateError> {
        let reason = match latest {
            ProbeOutcome::Failed(err) => return Err(SimulateError::Transport(err.clone())),
            ProbeOutcome::Observed(obs) if !obs.exists => "account not found",
            ProbeOutcome::Observed(obs) if !obs.executable => "account is not executable",
            ProbeOutcome::Observed(_) => return Ok(()),
        };
        Err(SimulateError::TargetNotExecutable { program_id: *program_id, reason: reason.to_string() })
    }

    pub async fn simulate<L>(
        ledger: &L,
        program_id: &Pubkey,
        identity: &Keypair,
        latest: &ProbeOutcome,
        deadline: Option<Instant>,
    ) -> Result<SimulationOutcome, SimulateError>
    where
        L: LedgerTransport + ?Sized,
    {
        check_target(program_id, latest)?;

        let blockhash = with_deadline(deadline, move || ledger.get_latest_blockhash()).await?;
        let transaction = probe_transaction(program_id, identity, blockhash);
        debug!(%program_id, %blockhash, "simulating probe instruction");

        let response = with_deadline(deadline, || ledger.simulate_transaction(&transaction)).await?;
        let outcome = SimulationOutcome {
            succeeded: response.err.is_none(),
            log_lines: response.logs,
            error: response.err,
        };
        info!(%program_id, succeeded = outcome.succeeded, logs = outcome.log_lines.len(), "dry run finished");
        Ok(outcome)
    }
}

// 11. mod pipeline
pub mod pipeline {
    use async_trait::async_trait;
    use futures::future::{join, join_all};
    use solana_program::{hash::Hash, pubkey::Pubkey};
    use solana_sdk::{signature::Keypair, transaction::Transaction};
    use std::collections::BTreeMap;
    use tokio::sync::{Mutex, Semaphore};
    use tokio::time::Instant;
    use tracing::{debug, info, warn};

    use crate::config::InspectorConfig;
    use crate::error::{InspectError, SimulateError, TransportError};
    use crate::ledger::{with_deadline, ClusterVersion, LedgerTransport, RemoteAccount, SimulationResponse};
    use crate::probe::{probe, probe_one};
    use crate::report::{DryRunStatus, ProgramStatus, TopologyReport};
    use crate::schema::{Roots, Topology};
    use crate::simulate::{simulate, SimulationOutcome};

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct RunReport {
        pub report: TopologyReport,
        /// Keyed by program slot.
        pub dry_runs: BTreeMap<String, DryRunStatus>,
    }

    /// Every transport call made through an inspector holds one of its
    /// `fan_out` permits, whichever operation issued it.
    struct Gated<'a, L> {
        ledger: &'a L,
        permits: &'a Semaphore,
    }

    impl<'a, L> Gated<'a, L> {
        async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'a>, TransportError> {
            self.permits.acquire().await.map_err(|_| TransportError::Cancelled)
        }
    }

    #[async_trait]
    impl<'a, L: LedgerTransport> LedgerTransport for Gated<'a, L> {
        async fn get_account_info(&self, address: &Pubkey) -> Result<Option<RemoteAccount>, TransportError> {
            let _permit = self.permit().await?;
            self.ledger.get_account_info(address).await
        }

        async fn get_latest_blockhash(&self) -> Result<Hash, TransportError> {
            let _permit = self.permit().await?;
            self.ledger.get_latest_blockhash().await
        }

        async fn simulate_transaction(&self, transaction: &Transaction) -> Result<SimulationResponse, TransportError> {
            let _permit = self.permit().await?;
            self.ledger.simulate_transaction(transaction).await
        }

        async fn get_cluster_version(&self) -> Result<ClusterVersion, TransportError> {
            let _permit = self.permit().await?;
            self.ledger.get_cluster_version().await
        }
    }

    pub struct Inspector<L> {
        config: InspectorConfig,
        ledger: L,
        permits: Semaphore,
        run_gate: Mutex<()>,
    }

    impl<L: LedgerTransport> Inspector<L> {
        pub fn new(config: InspectorConfig, ledger: L) -> Self {
            let permits = Semaphore::new(config.fan_out.get());
            Self { config, ledger, permits, run_gate: Mutex::new(()) }
        }

        fn gated(&self) -> Gated<'_, L> {
            Gated { ledger: &self.ledger, permits: &self.permits }
        }

        pub fn config(&self) -> &InspectorConfig {
            &self.config
        }

        pub fn ledger(&self) -> &L {
            &self.ledger
        }

        fn deadline(&self) -> Instant {
            Instant::now() + self.config.run_timeout
        }

        pub fn derive_topology(&self, roots: &Roots) -> Result<Topology, InspectError> {
            Ok(self.config.schema.resolve(roots, &self.config.programs)?)
        }

        pub fn check_reference(&self, topology: &Topology) -> Result<(), InspectError> {
            let Some(reference) = &self.config.reference_topology else {
                return Ok(());
            };
            let mismatches = topology.diff(reference);
            if mismatches.is_empty() {
                return Ok(());
            }
            for m in &mismatches {
                warn!(node = %m.node, expected = %m.expected, actual = ?m.actual, "reference topology mismatch");
            }
            Err(InspectError::ReferenceMismatch { mismatches })
        }

        pub async fn inspect(&self, topology: &Topology) -> TopologyReport {
            self.inspect_until(topology, self.deadline()).await
        }

        async fn inspect_until(&self, topology: &Topology, deadline: Instant) -> TopologyReport {
            let addresses = topology
                .iter()
                .map(|derived| derived.address)
                .chain(self.config.programs.iter().map(|(_, id)| *id));

            let ledger = self.gated();
            let (outcomes, version) = join(
                probe(&ledger, addresses, self.config.fan_out, Some(deadline)),
                with_deadline(Some(deadline), || ledger.get_cluster_version()),
            )
            .await;

            let cluster_version = match version {
                Ok(version) => Some(version),
                Err(err) => {
                    debug!(error = %err, "cluster version unavailable");
                    None
                }
            };
            TopologyReport::build(topology.clone(), &self.config.programs, &outcomes, cluster_version)
        }

        pub async fn probe_executability(&self, program_id: &Pubkey) -> ProgramStatus {
            ProgramStatus::classify(&probe_one(&self.gated(), program_id, Some(self.deadline())).await)
        }

        /// Probes the program first; simulation only happens when it is
        /// executable.
        pub async fn dry_run(&self, program_id: &Pubkey, identity: &Keypair) -> Result<SimulationOutcome, SimulateError> {
            let deadline = self.deadline();
            let ledger = self.gated();
            let latest = probe_one(&ledger, program_id, Some(deadline)).await;
            simulate(&ledger, program_id, identity, &latest, Some(deadline)).await
        }

        /// Derive, probe and optionally dry-run. Runs on one inspector never
        /// overlap.
        pub async fn run(&self, identity: &Keypair) -> Result<RunReport, InspectError> {
            let _gate = self.run_gate.lock().await;
            let deadline = self.deadline();

            let topology = self.derive_topology(&self.config.roots)?;
            self.check_reference(&topology)?;
            info!(nodes = topology.len(), fan_out = self.config.fan_out.get(), "inspection run started");

            let report = self.inspect_until(&topology, deadline).await;
            let dry_runs = self.dry_runs(&report, identity, deadline).await;

            info!(summary = %report.summary(), "inspection run finished");
            Ok(RunReport { report, dry_runs })
        }

        async fn dry_runs(
            &self,
            report: &TopologyReport,
            identity: &Keypair,
            deadline: Instant,
        ) -> BTreeMap<String, DryRunStatus> {
            if !self.config.enable_simulation {
                return report.programs.iter().map(|p| (p.slot.clone(), DryRunStatus::Disabled)).collect();
            }

            let ledger = &self.gated();
            let runs = report.programs.iter().map(|program| async move {
                let status = if program.status.is_executable() {
                    match simulate(ledger, &program.program_id, identity, &program.outcome, Some(deadline)).await {
                        Ok(outcome) => DryRunStatus::Completed(outcome),
                        Err(SimulateError::Transport(err)) => DryRunStatus::Failed(err),
                        Err(err @ SimulateError::TargetNotExecutable { .. }) => {
                            DryRunStatus::Skipped { reason: err.to_string() }
                        }
                    }
                } else {
                    warn!(slot = %program.slot, program_id = %program.program_id, status = %program.status, "dry run skipped");
                    DryRunStatus::Skipped { reason: format!("{} program is {}", program.slot, program.status) }
                };
                (program.slot.clone(), status)
            });
            join_all(runs).await.into_iter().collect()
        }
    }
}

pub use derive::{derive, DerivedAddress};
pub use pipeline::{Inspector, RunReport};
pub use schema::{derive_topology, ProgramSet, Roots, SeedSchema, Topology};
