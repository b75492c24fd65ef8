pub mod discretize;
pub mod import;
mod layer;
mod mamba1;
mod network;
pub mod params;
mod projector;
pub mod scan;
mod slots;

pub use discretize::{Discretization, Discretized};
pub use layer::{Mamba1Layer, Mamba1LayerConfig};
pub use mamba1::{Mamba1, Mamba1Config};
pub use network::{Mamba1Network, Mamba1NetworkConfig};
pub use params::{Decay, ParamEntry, ParamGroups};
pub use projector::{DtInit, Selection, SelectionProjector, SelectionProjectorConfig};
pub use scan::{ScanMode, ScanTrace};
