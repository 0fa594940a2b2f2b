//! Clustering, outlier models and their persistence

pub mod inference;
pub mod isolation_forest;
pub mod kmeans;
pub mod loader;
pub mod scaler;

pub use inference::{CohortScorer, ScoringReport};
pub use isolation_forest::{IsolationForest, IsolationForestParams};
pub use kmeans::{KMeans, KMeansParams};
pub use loader::{CohortModel, ModelLoader};
pub use scaler::StandardScaler;
