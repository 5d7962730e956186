//! The four queue families built on the shared envelope and worker pool.

pub mod analysis;
pub mod rasterizer;
pub mod ssh_import;
pub mod trajectory;

pub use analysis::{
    analysis_input_path, AnalysisProcessor, AnalysisReceipt, AnalysisRequest, AnalysisScheduler,
    RetrySummary,
};
pub use rasterizer::{enqueue_rasterization, RasterizeRequest, RasterizerProcessor};
pub use ssh_import::{
    RemoteFetcher, ScpFetcher, SshConnection, SshConnectionDirectory, SshImportProcessor,
    StaticConnectionDirectory,
};
pub use trajectory::{
    FrameRetrySummary, IngestReceipt, IngestRequest, TrajectoryIngestor, TrajectoryProcessor,
};
