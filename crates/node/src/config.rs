use mx::TransportConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tick_rate: u32,
    /// Stop after this many ticks; run until interrupted when `None`.
    pub max_ticks: Option<u64>,
    /// Send every received payload back to its sender.
    pub echo: bool,
    /// Group that newly connected sessions are placed in.
    pub group: Option<String>,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            max_ticks: None,
            echo: false,
            group: None,
            transport: TransportConfig::default(),
        }
    }
}
