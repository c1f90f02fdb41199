/// Toast surface of the host UI.
pub trait Notifier: Send + Sync {
    /// Shows a transient message to the user.
    fn show_toast(&self, message: &str);
}
