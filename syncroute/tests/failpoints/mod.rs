mod routing_pass_test;
