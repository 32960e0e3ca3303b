pub mod diff;
pub mod emitter;
pub mod schema;
pub mod values;

pub use emitter::Emitter;
pub use schema::Schema;
pub use values::MetricValues;
