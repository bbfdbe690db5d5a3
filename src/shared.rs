pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod path_safety;
