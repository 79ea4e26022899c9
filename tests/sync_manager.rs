use bitcoin::{Block, OutPoint};
use federation_ledger::chain::{ChainIndexer, ChainedHeader};
use federation_ledger::telemetry::init_tracing;
use federation_ledger::testing::{TestWallet, record, txid};
use federation_ledger::wallet::sync::events::{SyncEvent, SyncEventHandler};
use federation_ledger::wallet::sync::repositories::WalletRepository;
use federation_ledger::wallet::{Wallet, WalletError, WalletSyncManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Collects every event it sees.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<SyncEvent>>>);

impl Recorder {
    fn events(&self) -> Vec<SyncEvent> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for Recorder {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

/// Raises the shutdown flag once a given height is connected.
struct StopAt {
    height: u32,
    shutdown: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl SyncEventHandler for StopAt {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletError> {
        if let SyncEvent::BlockConnected { height, .. } = event {
            if *height == self.height {
                self.shutdown.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stop-at"
    }
}

async fn started_sync(wallet: &TestWallet) -> (WalletSyncManager, Recorder) {
    init_tracing(tracing::Level::DEBUG);
    let sync = wallet.sync_manager();
    let recorder = Recorder::default();
    sync.register_handler(Box::new(recorder.clone())).await;
    sync.start().await.unwrap();
    (sync, recorder)
}

/// Mine `count` empty main-chain blocks into the store without processing them.
fn mine_unprocessed(wallet: &TestWallet, count: u32) -> Vec<(Block, ChainedHeader)> {
    (0..count).map(|_| wallet.mine(Vec::new())).collect()
}

#[tokio::test]
async fn block_on_tip_is_applied_directly() {
    let wallet = TestWallet::started().await;
    let (sync, recorder) = started_sync(&wallet).await;
    let deposit = wallet.federation.deposit(10_000, 1);
    let (block, header) = wallet.mine(vec![deposit]);

    sync.process_block(block).await.unwrap();

    assert_eq!(sync.tip().await, Some(header));
    assert_eq!(wallet.manager.wallet_tip().await, Some((1, header.hash())));
    assert_eq!(
        recorder.events(),
        vec![SyncEvent::BlockConnected {
            height: 1,
            hash: header.hash(),
            changed: true
        }]
    );
    assert_eq!(wallet.store.fetch_count(), 0);
}

#[tokio::test]
async fn missing_blocks_are_replayed_from_the_store() {
    let wallet = TestWallet::started().await;
    let (sync, recorder) = started_sync(&wallet).await;
    let mut blocks = mine_unprocessed(&wallet, 5);
    let (last, header) = blocks.pop().unwrap();

    sync.process_block(last).await.unwrap();

    assert_eq!(wallet.manager.wallet_tip().await, Some((5, header.hash())));
    assert_eq!(wallet.store.fetch_count(), 4);
    let events = recorder.events();
    assert!(events.contains(&SyncEvent::CatchUpCompleted { tip_height: 4 }));
    let connected: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::BlockConnected { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    assert_eq!(connected, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn older_block_needs_no_replay() {
    let wallet = TestWallet::started().await;
    let (sync, _) = started_sync(&wallet).await;
    let blocks = mine_unprocessed(&wallet, 3);
    sync.process_block(blocks[2].0.clone()).await.unwrap();
    let fetches = wallet.store.fetch_count();

    sync.process_block(blocks[0].0.clone()).await.unwrap();

    assert_eq!(sync.tip().await, Some(blocks[2].1));
    assert_eq!(wallet.store.fetch_count(), fetches);
}

#[tokio::test]
async fn wallet_behind_tracked_tip_is_caught_up() {
    let wallet = TestWallet::started().await;
    let (sync, recorder) = started_sync(&wallet).await;
    let deposit = wallet.federation.deposit(10_000, 1);
    let coin = OutPoint::new(deposit.compute_txid(), 0);
    for txs in [vec![], vec![], vec![], vec![], vec![deposit]] {
        let (block, _) = wallet.mine(txs);
        sync.process_block(block).await.unwrap();
    }

    // Rewind the wallet behind the sync manager's back
    let fork = wallet.chain.header_at(3).unwrap();
    wallet.manager.remove_blocks(&fork).await.unwrap();
    assert!(!wallet.manager.snapshot().await.unwrap().ledger().contains(&coin));
    let rewound_at = recorder.events().len();

    let (next, header) = wallet.mine(Vec::new());
    sync.process_block(next).await.unwrap();

    assert_eq!(wallet.manager.wallet_tip().await, Some((6, header.hash())));
    assert_eq!(sync.tip().await, Some(header));
    assert_eq!(wallet.store.fetch_count(), 2);
    assert!(wallet.manager.snapshot().await.unwrap().ledger().contains(&coin));
    let replayed: Vec<u32> = recorder.events()[rewound_at..]
        .iter()
        .filter_map(|event| match event {
            SyncEvent::BlockConnected { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, vec![4, 5, 6]);
}

#[tokio::test]
async fn reorganization_replaces_the_stale_branch() {
    let wallet = TestWallet::started().await;
    let (sync, recorder) = started_sync(&wallet).await;

    let fork = wallet.advance_to(15).await;
    sync.start().await.unwrap();

    let shared = wallet.federation.deposit(10_000, 1);
    let only_a = wallet.federation.deposit(20_000, 2);
    let shared_coin = OutPoint::new(shared.compute_txid(), 0);
    let only_a_coin = OutPoint::new(only_a.compute_txid(), 0);

    // Branch A: 16..20 on the main chain
    for txs in [vec![shared.clone()], vec![only_a], vec![], vec![], vec![]] {
        let (block, _) = wallet.mine(txs);
        sync.process_block(block).await.unwrap();
    }
    let before = wallet.manager.snapshot().await.unwrap();
    let shared_before = before.ledger().try_get(&shared_coin).unwrap().clone();
    assert!(before.ledger().contains(&only_a_coin));

    // Branch B: 16..20 from the same fork, then made the main chain
    let mut parent = fork;
    let mut branch_b = Vec::new();
    for txs in [vec![shared], vec![], vec![], vec![], vec![]] {
        let (block, header) = wallet.chain.add_block(&parent, 1, txs);
        wallet.store.insert(block.clone());
        branch_b.push((block, header));
        parent = header;
    }
    wallet.chain.reorganize_to(&parent);

    let (tip_block, tip_header) = branch_b.last().unwrap().clone();
    sync.process_block(tip_block).await.unwrap();

    let after = wallet.manager.snapshot().await.unwrap();
    assert!(!after.ledger().contains(&only_a_coin));
    let shared_after = after.ledger().try_get(&shared_coin).unwrap();
    assert_eq!(shared_after.block_height, Some(16));
    assert_eq!(shared_after.block_hash, Some(branch_b[0].1.hash()));
    assert_eq!(shared_after.creation_time, shared_before.creation_time);
    assert_eq!(
        wallet.manager.wallet_tip().await,
        Some((20, tip_header.hash()))
    );
    assert!(recorder.events().contains(&SyncEvent::BlocksDisconnected {
        fork_height: 15,
        fork_hash: fork.hash(),
        previous_tip_height: 20,
    }));
    assert_eq!(wallet.manager.find_unresolvable_history().await, None);
}

#[tokio::test]
async fn unavailable_block_pauses_catch_up_until_next_notification() {
    let wallet = TestWallet::started().await;
    let (sync, recorder) = started_sync(&wallet).await;
    let blocks = mine_unprocessed(&wallet, 5);
    let held = blocks[2].1;
    wallet.store.hold_back(held.hash());

    sync.process_block(blocks[4].0.clone()).await.unwrap();

    // Blocks 1 and 2 once, block 3 for every allowed attempt
    let retries = wallet.manager.settings().block_fetch_retries as usize;
    assert_eq!(wallet.store.fetch_count(), 2 + retries);
    assert_eq!(wallet.manager.wallet_tip().await.unwrap().0, 2);
    assert_eq!(sync.tip().await, Some(blocks[1].1));
    assert!(recorder.events().contains(&SyncEvent::CatchUpStalled {
        height: 3,
        hash: held.hash()
    }));

    wallet.store.release(&held.hash());
    let (next, header) = wallet.mine(Vec::new());
    sync.process_block(next).await.unwrap();

    assert_eq!(wallet.manager.wallet_tip().await, Some((6, header.hash())));
}

#[tokio::test]
async fn shutdown_abandons_catch_up_between_blocks() {
    let wallet = TestWallet::started().await;
    let (sync, _) = started_sync(&wallet).await;
    sync.register_handler(Box::new(StopAt {
        height: 2,
        shutdown: sync.shutdown_flag(),
    }))
    .await;
    let blocks = mine_unprocessed(&wallet, 6);

    sync.process_block(blocks[5].0.clone()).await.unwrap();

    assert_eq!(wallet.manager.wallet_tip().await, Some((2, blocks[1].1.hash())));
    assert_eq!(wallet.store.fetch_count(), 2);
}

#[tokio::test]
async fn start_recovers_from_locator_when_tip_left_the_chain() {
    let wallet = TestWallet::started().await;
    for _ in 0..5 {
        wallet.mine_and_process(Vec::new()).await;
    }
    let fork = wallet.chain.header_at(3).unwrap();
    let mut parent = fork;
    for _ in 0..3 {
        parent = wallet.chain.add_block(&parent, 1, Vec::new()).1;
    }
    wallet.chain.reorganize_to(&parent);

    let sync = wallet.sync_manager();
    let resumed = sync.start().await.unwrap();

    assert_eq!(resumed, fork);
    assert_eq!(wallet.manager.wallet_tip().await, Some((3, fork.hash())));
    assert_eq!(sync.tip().await, Some(fork));
}

#[tokio::test]
async fn start_rolls_back_history_that_no_longer_resolves() {
    let wallet = TestWallet::new();
    let blocks = mine_unprocessed(&wallet, 4);
    let tip = blocks[3].1;
    let mut file = Wallet::new(
        wallet.manager.settings(),
        &wallet.federation.params(),
        &tip,
        wallet.chain.locator_for(&tip),
    )
    .unwrap();
    // Confirmed in a block hash that is not on the chain at height 2
    file.ledger_mut().add(record(txid(1), 0, 10_000, Some(2)));
    file.ledger_mut().add(record(txid(2), 0, 10_000, None));
    wallet.repository.save(&file).await.unwrap();

    let sync = wallet.sync_manager();
    let resumed = sync.start().await.unwrap();

    assert_eq!(resumed, blocks[0].1);
    let snapshot = wallet.manager.snapshot().await.unwrap();
    assert!(!snapshot.ledger().contains(&OutPoint::new(txid(1), 0)));
    assert!(snapshot.ledger().contains(&OutPoint::new(txid(2), 0)));
    wallet.manager.verify_spending_history().await.unwrap();
}

#[tokio::test]
async fn ingestion_queue_feeds_blocks_in_order() {
    let wallet = TestWallet::started().await;
    let sync = Arc::new(wallet.sync_manager());
    sync.start().await.unwrap();
    let queue = sync.spawn_ingestion_queue();

    let deposit = wallet.federation.deposit(10_000, 1);
    let mut last = None;
    for txs in [vec![deposit], vec![], vec![]] {
        let (block, header) = wallet.mine(txs);
        assert!(queue.try_enqueue(block));
        last = Some(header);
    }
    queue.wait_drained().await;
    queue.shutdown().await;

    let tip = last.unwrap();
    assert_eq!(wallet.manager.wallet_tip().await, Some((3, tip.hash())));
    assert_eq!(wallet.store.fetch_count(), 0);
    assert_eq!(wallet.manager.snapshot().await.unwrap().ledger().len(), 1);
}
