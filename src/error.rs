use thiserror::Error;

/// An error returned when a thread fails to register with a hazard pointer
/// slot table.
#[derive(Copy, Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum RegistrationError {
    /// Every slot is currently owned by another registration.
    #[error("no hazard pointer slot available, all {capacity} slots are in use")]
    Exhausted {
        /// The fixed number of slots in the table.
        capacity: usize,
    },
}
