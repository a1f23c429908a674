pub mod chunking_strategy;
pub mod directory_watcher;
pub mod file_reader;
pub mod hybrid_search;
pub mod indexing_pipeline;
pub mod search;
pub mod sync_engine;
pub mod task_queue;
