//! # PTA CW Sampler
//!
//! A **parallel-tempered Markov Chain Monte Carlo** sampler for continuous gravitational waves
//! (CWs) in pulsar timing array data.
//!
//! The cost of a PTA likelihood is dominated by the signal basis, which depends only on a few
//! "shape" parameters (GW frequency, sky location, chirp mass, pulsar distances). The sampler
//! exploits this through a [`FastLikelihoodCache`](cache::FastLikelihoodCache): the basis is
//! rebuilt once per block of iterations and whenever a shape parameter moves, all other
//! candidates (amplitude, orientation, phases, noise) are scored against the cached basis.
//!
//! ## Building blocks
//!
//! 1. [`ParameterSpace`](params::ParameterSpace): names, priors and groups of the parameters.
//! 2. A [`FastLikelihood`](likelihood::FastLikelihood): [`CwLikelihood`](likelihood::cw::CwLikelihood)
//!    for the CW search, or any other model split into shape and projection parameters.
//! 3. A [`ProposalEngine`](proposal::ProposalEngine): prior draws, differential evolution,
//!    Fisher jumps and empirical-distribution draws, chosen by weight per parameter group.
//! 4. [`ParallelTempering`](tempering::ParallelTempering): the ladder of
//!    [`ChainState`](chain::ChainState)s, block loop, temperature swaps and checkpoints.
//! 5. A [`CheckpointWriter`](checkpoint::CheckpointWriter):
//!    [`CsvCheckpoint`](io::csv::CsvCheckpoint) on disk or
//!    [`MemoryCheckpoint`](checkpoint::MemoryCheckpoint) in memory.
//!
//! ## Example: sampling a synthetic array
//!
//! ```rust
//! use pta_cw_sampler::checkpoint::MemoryCheckpoint;
//! use pta_cw_sampler::empirical::EmpiricalSet;
//! use pta_cw_sampler::proposal::ProposalEngine;
//! use pta_cw_sampler::synthetic::{CwInjection, SyntheticPta};
//! use pta_cw_sampler::tempering::ParallelTempering;
//!
//! // Three pulsars with an injected CW.
//! let pta = SyntheticPta::builder()
//!     .n_pulsars(3)
//!     .n_toas(60)
//!     .inject(CwInjection::default())
//!     .build(42)?;
//!
//! // 3 chains, 2 blocks of 100 iterations.
//! let config = pta.config();
//! let space = pta.space(&config)?;
//! let likelihood = pta.likelihood(&space, &config)?;
//! let engine = ProposalEngine::new(&config, EmpiricalSet::empty(&space));
//!
//! let mut sampler =
//!     ParallelTempering::new(&likelihood, &space, &engine, &config, MemoryCheckpoint::default())?;
//! let summary = sampler.run()?;
//! assert_eq!(summary.shape_updates, 2 * 3);
//!
//! let samples = sampler.into_writer().rows;
//! println!("Collected {} samples of the cold chain", samples.len());
//! # Ok::<(), pta_cw_sampler::error::Error>(())
//! ```
//!
//! ## Command line
//!
//! The `pta-cw-sampler` binary runs the CW search on JSON pulsar data and writes the samples of
//! the coldest chains to an append-only CSV table, with a JSON summary and a resume snapshot next
//! to it. Enable the `parquet` feature to also export the finished table to Parquet.

pub mod cache;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod dev_tools;
pub mod empirical;
pub mod error;
pub mod fisher;
pub mod io;
pub mod likelihood;
pub mod params;
pub mod proposal;
pub mod stats;
pub mod synthetic;
pub mod tempering;

pub use config::SamplerConfig;
pub use error::{Error, Result};
pub use tempering::ParallelTempering;
