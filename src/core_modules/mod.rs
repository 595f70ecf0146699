pub mod calibration;
pub mod contrast;
pub mod destination;
pub mod flow;
pub mod motion_sampler;
pub mod roi;
pub mod series_logger;
pub mod smoother;
