pub mod injector;
pub mod resolver;

pub use injector::{inject, InjectMode, InjectPosition, InjectSpec, InjectionOutcome};
pub use resolver::{resolve_dependencies, DependencyResolution};
