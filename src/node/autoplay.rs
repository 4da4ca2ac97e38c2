//! Picks a follow-up track once the queue runs dry.

use std::sync::Arc;

use tracing::debug;

use crate::{
    node::Node,
    player::{PlayOptions, Player, PlayerError},
    protocol::tracks::Track,
};

/// Recommendation query for the source `seed` came from.
pub fn recommendation_query(seed: &Track) -> String {
    let info = &seed.info;
    match info.source_name.to_ascii_lowercase().as_str() {
        "youtube" | "youtubemusic" => format!(
            "https://www.youtube.com/watch?v={0}&list=RD{0}",
            info.identifier
        ),
        "spotify" => format!("sprec:seed_tracks={}", info.identifier),
        "deezer" => format!("dzrec:{}", info.identifier),
        "soundcloud" if info.uri.is_some() => {
            format!("{}/recommended", info.uri.as_deref().unwrap_or_default())
        }
        _ => format!("ytmsearch:{}", info.author),
    }
}

/// Loads recommendations for `seed` and plays the first one that has not
/// been heard yet. Returns whether something was started.
pub(crate) async fn run(node: &Node, player: &Arc<Player>, seed: &Track) -> Result<bool, PlayerError> {
    let query = recommendation_query(seed);
    debug!("[{}] Autoplay query: {}", player.guild_id(), query);

    let history = player.state().history;
    let candidate = node
        .rest()
        .load_tracks(&query)
        .await?
        .into_tracks()
        .into_iter()
        .find(|t| t != seed && !history.contains(t));

    let Some(track) = candidate else {
        return Ok(false);
    };
    player.enqueue(vec![track.with_requester(serde_json::json!("autoplay"))]);
    player.play(PlayOptions::default()).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::PlayerConfig,
        player::manager::PlayerOptions,
        protocol::tracks::TrackInfo,
        test_support::{MockNode, ready_client_with, sample_track},
    };

    fn seed(source: &str, uri: Option<&str>) -> Track {
        Track::new(TrackInfo {
            identifier: "abc".into(),
            author: "Artist".into(),
            title: "Song".into(),
            source_name: source.into(),
            uri: uri.map(String::from),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_queries_per_source() {
        assert_eq!(
            recommendation_query(&seed("youtube", None)),
            "https://www.youtube.com/watch?v=abc&list=RDabc"
        );
        assert_eq!(recommendation_query(&seed("spotify", None)), "sprec:seed_tracks=abc");
        assert_eq!(recommendation_query(&seed("deezer", None)), "dzrec:abc");
        assert_eq!(
            recommendation_query(&seed("soundcloud", Some("https://soundcloud.com/a/b"))),
            "https://soundcloud.com/a/b/recommended"
        );
        assert_eq!(recommendation_query(&seed("bandcamp", None)), "ytmsearch:Artist");
    }

    #[tokio::test]
    async fn test_autoplay_skips_seed_and_history() {
        let mock = MockNode::start().await;
        let config = PlayerConfig {
            autoplay: true,
            ..Default::default()
        };
        let (client, node) = ready_client_with(&mock, mock.node_config(), config).await;
        let player = client.client.players().create(PlayerOptions::new("1")).unwrap();

        let heard = sample_track("heard", 100_000);
        let seed = sample_track("seed", 100_000);
        let fresh = sample_track("fresh", 100_000);
        player.play(PlayOptions::track(heard.clone())).await.unwrap();
        player.play(PlayOptions::track(seed.clone())).await.unwrap();

        mock.respond(
            "GET",
            "/v4/loadtracks",
            serde_json::json!({"loadType": "search", "data": [seed, heard, fresh]}),
        );

        assert!(run(&node, &player, &seed).await.unwrap());
        let state = player.state();
        assert_eq!(state.current.as_ref(), Some(&fresh));
        assert_eq!(
            state.current.unwrap().requester,
            Some(serde_json::json!("autoplay"))
        );
    }
}
