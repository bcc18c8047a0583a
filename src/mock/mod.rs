pub mod mock_time;
