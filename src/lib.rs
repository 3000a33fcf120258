/*!
# layerwise
Unsupervised layerwise pretraining on [ndarray](https://docs.rs/ndarray).

Provides denoising autoencoders, stacks of them, and restricted Boltzmann
machines trained with persistent contrastive divergence. Models are trained
with stochastic gradient descent, with an annealed learning rate and per
parameter learning rate scales.

```no_run
# use layerwise::{config::{DaConfig, RunConfig}, dataset::{synthetic_normal, train_valid_test_split}};
# fn main() -> anyhow::Result<()> {
let conf = RunConfig::<DaConfig>::from_path("da.json")?;
let data = synthetic_normal(1000, 15, 0);
let (train, valid, test) = train_valid_test_split(data.view(), 0.1, 0.1);
let (da, report) = layerwise::learn::pretrain::train_da(&conf, train, valid, test)?;
# Ok(())
# }
```

Library code emits [`tracing`](https://docs.rs/tracing) events, install a
subscriber to see them.
*/
#![warn(missing_docs)]

pub mod config;
pub mod corruption;
pub mod dataset;
/// Errors.
pub mod error;
pub mod init;
pub mod learn;
pub mod snapshot;

pub use error::Error;
