pub mod normalize;
pub mod provider;
pub mod upstream;

pub use normalize::normalize;
pub use provider::ScoreProvider;
pub use upstream::HttpScoreProvider;
