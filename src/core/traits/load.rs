/// Source of the system load average used for admission control.
#[mockall::automock]
pub trait LoadSource: std::fmt::Debug + Send + Sync {
    fn load_average(&self) -> f64;
}
