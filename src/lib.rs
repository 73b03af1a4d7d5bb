pub mod tasker;
pub mod util;
