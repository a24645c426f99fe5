pub mod provisioner;
pub mod stealth;
