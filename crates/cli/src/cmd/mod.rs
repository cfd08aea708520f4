mod pack;

pub use pack::{EXIT_USAGE, PackArgs, cmd_pack};
