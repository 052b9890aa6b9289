pub mod dither;
pub mod estimate_store;
pub mod exposure;
pub mod frame_name;
pub mod options;
pub mod progress;
pub mod session_control;
pub mod session_engine;
pub mod skyx_client;
pub mod work_item;
