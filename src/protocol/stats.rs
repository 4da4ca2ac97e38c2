use serde::Deserialize;

/// Node statistics, pushed in `stats` messages and served by GET /v4/stats.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

impl NodeStats {
    /// Load penalty, lower is better.
    ///
    /// Playing players count once each, CPU load grows exponentially, and
    /// frame loss (nulled or missing frames per minute) is weighted heavily.
    pub fn penalty(&self) -> f64 {
        let players = f64::from(self.playing_players);
        let cpu = 1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0;

        let (deficit, nulled) = match &self.frame_stats {
            Some(frames) if frames.sent >= 0 => {
                let deficit = 1.03f64.powf(500.0 * (frames.deficit as f64 / 3000.0)) * 600.0 - 600.0;
                let nulled =
                    (1.03f64.powf(500.0 * (frames.nulled as f64 / 3000.0)) * 300.0 - 300.0) * 2.0;
                (deficit, nulled)
            }
            _ => (0.0, 0.0),
        };

        players + cpu + deficit + nulled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(playing: u32, load: f64) -> NodeStats {
        NodeStats {
            players: playing,
            playing_players: playing,
            uptime: 1,
            memory: Memory {
                free: 0,
                used: 0,
                allocated: 0,
                reservable: 0,
            },
            cpu: Cpu {
                cores: 4,
                system_load: load,
                lavalink_load: load,
            },
            frame_stats: None,
        }
    }

    #[test]
    fn test_penalty_grows_with_load_and_players() {
        assert!(stats(0, 0.0).penalty().abs() < f64::EPSILON);
        assert!(stats(5, 0.0).penalty() < stats(5, 0.5).penalty());
        assert!(stats(1, 0.1).penalty() < stats(10, 0.1).penalty());
    }

    #[test]
    fn test_stats_parse_from_wire() {
        let json = r#"{"players":3,"playingPlayers":1,"uptime":123,
            "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
            "cpu":{"cores":2,"systemLoad":0.1,"lavalinkLoad":0.05}}"#;
        let stats: NodeStats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.players, 3);
        assert_eq!(stats.playing_players, 1);
        assert!(stats.frame_stats.is_none());
    }
}
