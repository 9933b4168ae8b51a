mod merch;
mod money;
mod operation;
mod user;
mod user_info;

pub use merch::*;
pub use money::*;
pub use operation::*;
pub use user::*;
pub use user_info::*;
