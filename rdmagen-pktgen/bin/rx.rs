//! Count all packets arriving on a port of an RDMA capable card.
//!
//! Installs a sniffer rule, so other consumers of the port still see their traffic. Prints the
//! packet rate about once a second. Call example:
//!
//! * `rdmagen-rx mlx5_0 --replenish counted`
use rdmagen::nic::Verbs;
use rdmagen_pktgen::config::{self, RxOptions};

fn main() {
    let options: RxOptions = config::parse();
    rdmagen_pktgen::init_logging();

    let mut verbs = Verbs::default();
    match rdmagen_pktgen::receive(&mut verbs, &options, &mut rdmagen_pktgen::print_sample) {
        Ok(never) => match never {},
        Err(err) => rdmagen_pktgen::fail(err),
    }
}
