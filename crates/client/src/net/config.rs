use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub user_id: u64,
    pub hellos: u32,
    pub linger: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "polynet".to_string(),
            user_id: 1,
            hellos: 1,
            linger: Duration::from_secs(5),
        }
    }
}
