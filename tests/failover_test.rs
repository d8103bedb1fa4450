mod common;

use common::{agreed_leader, eventually, start_cluster};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn survivors_elect_a_new_leader_after_the_leader_dies() -> anyhow::Result<()> {
    let mut nodes = start_cluster(4).await?;

    let cluster = nodes.as_slice();
    let first = eventually(Duration::from_secs(30), move || agreed_leader(cluster))
        .await
        .expect("cluster should agree on a first leader");

    let index = nodes
        .iter()
        .position(|running| running.id() == first)
        .expect("leader is one of the nodes");
    nodes.remove(index).kill().await;

    // The survivors lose the leader's relay, fail over to the same registry
    // entry and hold a fresh election there.
    let survivors = nodes.as_slice();
    let second = eventually(Duration::from_secs(30), move || async move {
        agreed_leader(survivors).await.filter(|leader| *leader != first)
    })
    .await
    .expect("survivors should agree on a new leader");

    assert!(nodes.iter().any(|running| running.id() == second));
    for running in &nodes {
        let info = running
            .node
            .consensus()
            .leader_info()
            .await
            .expect("survivor knows the new leader");
        assert_eq!(info.node_id, second);
        assert!(info.term.is_valid());
    }
    Ok(())
}
