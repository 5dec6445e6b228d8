//! Full rounds through coordinator, clients, mix nodes and mailboxes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use xrd::{Client, Coordinator, Directory, MixNode, NodeOptions};
use xrd_config::create_groups;
use xrd_mailbox::Mailbox;
use xrd_util::logging::init_logging;

struct Deployment {
    coordinator: Coordinator,
    client: Arc<Client>,
}

fn deploy(rows: Vec<Vec<String>>, opts: NodeOptions, num_mailboxes: usize) -> Deployment {
    init_logging();
    let (servers, groups) = create_groups(&rows, opts.verifiable);
    let servers = Arc::new(servers);
    let groups = Arc::new(groups);

    let addresses: HashSet<String> = rows.iter().flatten().cloned().collect();
    let nodes: HashMap<String, MixNode> = addresses
        .into_iter()
        .map(|addr| {
            let node = MixNode::new(addr.clone(), servers.clone(), groups.as_ref(), opts);
            (addr, node)
        })
        .collect();

    let mailboxes: HashMap<String, Arc<Mailbox>> = (0..num_mailboxes)
        .map(|i| (format!("mailbox:{i}"), Arc::new(Mailbox::new())))
        .collect();

    let directory = Directory::new(nodes.clone(), mailboxes);
    for node in nodes.values() {
        node.set_directory(directory.clone());
    }

    let client = Client::new(servers, groups, directory.clone(), opts.verifiable);
    let coordinator = Coordinator::new(
        directory,
        nodes.into_values().collect(),
        vec![client.clone()],
    );

    Deployment {
        coordinator,
        client,
    }
}

fn one_group(k: usize) -> Vec<Vec<String>> {
    vec![(0..k)
        .map(|i| format!("node:{}", i % 2))
        .collect::<Vec<_>>()]
}

#[tokio::test(flavor = "multi_thread")]
async fn verifiable_round_delivers_all_mail() {
    let opts = NodeOptions {
        verifiable: true,
        client_verifiable: true,
        aux_size: 0,
    };
    let deployment = deploy(one_group(4), opts, 2);

    let delivered = deployment
        .coordinator
        .run_round(0, 12, 64)
        .await
        .expect("round should complete");

    // one group: every user is assigned exactly once
    assert_eq!(delivered, 12);
    assert_eq!(deployment.client.expected_deliveries(), 12);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_verifiable_round_delivers_all_mail() {
    let opts = NodeOptions {
        verifiable: false,
        client_verifiable: false,
        aux_size: 0,
    };
    let deployment = deploy(one_group(4), opts, 2);

    let delivered = deployment
        .coordinator
        .run_round(3, 12, 100)
        .await
        .expect("round should complete");
    assert_eq!(delivered, 12);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_group_round_spans_cascades() {
    let opts = NodeOptions {
        verifiable: true,
        client_verifiable: false,
        aux_size: 0,
    };
    // four parallel groups of three servers over three node addresses
    let rows: Vec<Vec<String>> = (0..4)
        .map(|g| {
            (0..3)
                .map(|s| format!("node:{}", (g + s) % 3))
                .collect::<Vec<_>>()
        })
        .collect();
    let deployment = deploy(rows, opts, 2);

    let delivered = deployment
        .coordinator
        .run_round(0, 24, 48)
        .await
        .expect("round should complete");

    // square-root assignment: each user routes through 2 or 3 groups
    let expected = deployment.client.expected_deliveries();
    assert_eq!(delivered, expected);
    assert!(delivered >= 24 * 2 && delivered <= 24 * 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn consecutive_rounds_are_independent() {
    let opts = NodeOptions {
        verifiable: true,
        client_verifiable: true,
        aux_size: 0,
    };
    let deployment = deploy(one_group(3), opts, 1);

    for round in 0..2 {
        let delivered = deployment
            .coordinator
            .run_round(round, 6, 32)
            .await
            .expect("round should complete");
        assert_eq!(delivered, 6);
    }
}
