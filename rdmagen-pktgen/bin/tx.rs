//! Send packets out of an RDMA capable card at line rate.
//!
//! Sends a single built-in DNS query, or the packets of a capture file, in a loop. Prints the
//! packet rate about once a second. Call example:
//!
//! * `rdmagen-tx mlx5_0 traffic.pcap --depth 4 --batch 512`
use rdmagen::nic::Verbs;
use rdmagen_pktgen::config::{self, TxOptions};

fn main() {
    let options: TxOptions = config::parse();
    rdmagen_pktgen::init_logging();

    let mut verbs = Verbs::default();
    match rdmagen_pktgen::transmit(&mut verbs, &options, &mut rdmagen_pktgen::print_sample) {
        Ok(never) => match never {},
        Err(err) => rdmagen_pktgen::fail(err),
    }
}
