// crates/manifold-server/src/background/mod.rs
// Background workers

mod reconcile;

pub use reconcile::reconcile;
