pub mod align;
pub mod timing;
