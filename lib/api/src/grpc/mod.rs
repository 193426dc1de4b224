pub mod transport_channel_pool;
