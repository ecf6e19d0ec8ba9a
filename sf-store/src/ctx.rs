use sf_domain::PlayerId;

/// Caller identity threaded through every repository call. The Db layer
/// does not authorize on it today; it exists so call sites never lose the
/// acting player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ctx {
    Anonymous,
    Player(PlayerId),
}

impl Ctx {
    pub fn for_player(player_id: PlayerId) -> Self {
        Ctx::Player(player_id)
    }
}
