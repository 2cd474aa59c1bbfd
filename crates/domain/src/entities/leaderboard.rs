//! 排行榜投影
//!
//! 排名是派生值，每次都从分数行完整重算。

use serde::{Deserialize, Serialize};

use crate::value_objects::ActorId;

/// 存储端聚合查询返回的分数行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub actor: ActorId,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub actor: ActorId,
    pub rank: u32,
    pub score: i64,
}

/// 分数降序，分数相同按参与者ID升序，rank = 位置 + 1。
/// 输入顺序不影响结果。
pub fn rank_scores(mut rows: Vec<ScoreRow>, limit: usize) -> Vec<LeaderboardEntry> {
    rows.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.actor.cmp(&b.actor)));
    rows.into_iter()
        .take(limit)
        .enumerate()
        .map(|(position, row)| LeaderboardEntry {
            actor: row.actor,
            rank: position as u32 + 1,
            score: row.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn row(id: u128, score: i64) -> ScoreRow {
        ScoreRow {
            actor: ActorId::from(Uuid::from_u128(id)),
            score,
        }
    }

    #[test]
    fn ranks_descending_with_actor_tie_break() {
        let ranked = rank_scores(vec![row(3, 10), row(1, 50), row(2, 10)], 10);

        let order: Vec<(u128, u32)> = ranked
            .iter()
            .map(|e| (e.actor.0.as_u128(), e.rank))
            .collect();
        assert_eq!(order, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn tie_order_is_stable_across_input_orderings() {
        let a = rank_scores(vec![row(7, 5), row(4, 5), row(9, 5)], 10);
        let b = rank_scores(vec![row(9, 5), row(7, 5), row(4, 5)], 10);
        assert_eq!(a, b);
    }

    #[test]
    fn limit_truncates_after_sorting() {
        let ranked = rank_scores(vec![row(1, 1), row(2, 2), row(3, 3)], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].score, 3);
    }
}
