// src/lib.rs
pub mod ports {
    pub mod execution;
    pub mod market_data;
    pub mod replay_source;
}
pub mod trade {
    pub mod execution {
        pub mod paper_executor;
    }
}
pub mod admission;
pub mod averaging;
pub mod capital;
pub mod config;
pub mod engine;
pub mod error;
pub mod exit;
pub mod model;
pub mod pair_state;
pub mod pixel_spread;
pub mod scoring;
pub mod volatility;
